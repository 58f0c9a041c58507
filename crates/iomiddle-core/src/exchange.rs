//! Two-phase exchange (C5): the inter-process gather/scatter that turns
//! per-rank stripes into one forwarder's contiguous on-disk chunk, in
//! either all-ranks or forwarder mode.
//!
//! Grounded on `spec.md` §4.5 for both modes' formulas and on
//! `original_source/src/io_middle.c`'s `buf_flush`/`_iomiddle_read` for the
//! baseline (lanes=1, no forwarder) gather-per-root-then-pwrite /
//! read-then-scatter shape this module generalizes. Forwarder-mode chunk
//! rotation has no surviving draft in `original_source` (`spec.md` §9 notes
//! the drafts diverge on exactly this point); the rotation implemented here
//! — one forwarder-sized chunk per local-group flush, positioned by
//! `(round, color)` rather than `(round, rank)` — is this workspace's
//! resolution, recorded in `DESIGN.md`.

use crate::descriptor::DescriptorState;
use crate::global::GlobalState;

/// What this rank must do to complete a flush: write `payload` at `pos` if
/// `should_write` is set, otherwise nothing (the gather step still ran, but
/// this rank wasn't a root/forwarder for this round).
pub struct FlushPlan {
    pub pos: u64,
    pub payload: Vec<u8>,
    pub should_write: bool,
}

/// What this rank must do to refill its stripe buffer: issue a disk read of
/// `len` bytes at `pos` if `should_read` is set (all-ranks mode: every rank
/// reads its own `lanes` chunks; forwarder mode: only the forwarder reads),
/// then call [`scatter_after_read`] with whatever came back.
pub struct RefillPlan {
    pub pos: u64,
    pub len: usize,
    pub should_read: bool,
}

/// Runs the gather half of a flush and returns this rank's resulting disk
/// write, if any. `desc.bufcount` stripes are assumed staged
/// (`desc.ready_to_flush()` true, or a tail flush at close).
pub fn gather_for_flush(global: &GlobalState, desc: &mut DescriptorState) -> FlushPlan {
    if global.forwarder_mode() {
        gather_for_flush_forwarder(global, desc)
    } else {
        gather_for_flush_all_ranks(global, desc)
    }
}

/// All-ranks mode (`spec.md` §4.5(a)): iterate every staged stripe slot,
/// gather it onto the rank that owns that slot's lane cycle, and land the
/// result in this rank's `sbuf` at the matching lane offset.
fn gather_for_flush_all_ranks(global: &GlobalState, desc: &mut DescriptorState) -> FlushPlan {
    let lanes = desc.lanes as usize;
    let strsize = desc.strsize;
    let chunklen = desc.chunklen;
    let bufcount = desc.bufcount as usize;
    let strcnt = desc.strcnt as u64;
    let filcurb_before = desc.filcurb;

    let mut lanes_collected = 0u32;
    for j in 0..bufcount {
        let this_rank = (j / lanes) as u32;
        let send = &desc.ubuf[j * strsize..(j + 1) * strsize];
        if let Some(chunk) = global.world.gather(this_rank, send) {
            let lane_idx = j % lanes;
            desc.sbuf_mut()[lane_idx * chunklen..(lane_idx + 1) * chunklen].copy_from_slice(&chunk);
            lanes_collected += 1;
        }
    }

    let lanes_u64 = desc.lanes as u64;
    desc.filcurb += strcnt * lanes_u64;
    desc.filtail += strcnt * lanes_u64;

    if lanes_collected == 0 {
        return FlushPlan {
            pos: 0,
            payload: Vec::new(),
            should_write: false,
        };
    }

    // "wblks = nth * (strcnt^2 * lanes) + (strcnt * lanes) * frank,
    // where nth = filcurb_before_flush / (strcnt^2 * lanes)" (spec.md §4.5).
    let period = strcnt * strcnt * lanes_u64;
    let nth = filcurb_before / period;
    let wblks = nth * period + (strcnt * lanes_u64) * u64::from(global.frank);
    let pos = wblks * strsize as u64;
    let payload = desc.sbuf()[..chunklen * desc.lanes as usize].to_vec();

    FlushPlan {
        pos,
        payload,
        should_write: true,
    }
}

/// Tail flush at close (`spec.md` §4.4: "at flush boundary `buflanes` is set
/// to 1 at close to force the remainder through"): degrades to single-lane
/// semantics over whatever `bufcount` stripes remain, regardless of the
/// descriptor's configured lane count. Ranks whose index is `>= bufcount`
/// simply have nothing buffered this round and don't write, matching
/// `original_source/src/io_middle.c`'s `buf_flush`: `if (Myrank <
/// info->bufcount) { ...write... }`.
pub fn gather_for_tail_flush(global: &GlobalState, desc: &mut DescriptorState) -> FlushPlan {
    if global.forwarder_mode() {
        // Forwarder mode flushes every single stripe as it's staged
        // (bufcount target is forced to 1), so by the time a close reaches
        // here there is usually nothing left; only run the local-group
        // gather if a stripe is actually sitting in `ubuf` unflushed; a
        // stale `ubuf` from the last flush must not be resent.
        if desc.bufcount == 0 {
            return FlushPlan {
                pos: 0,
                payload: Vec::new(),
                should_write: false,
            };
        }
        return gather_for_flush_forwarder(global, desc);
    }
    let strsize = desc.strsize;
    let chunklen = desc.chunklen;
    let bufcount = desc.bufcount as usize;
    let strcnt = desc.strcnt as u64;
    let filcurb_before = desc.filcurb;

    let mut got_chunk = false;
    for j in 0..bufcount {
        let this_rank = j as u32;
        let send = &desc.ubuf[j * strsize..(j + 1) * strsize];
        if let Some(chunk) = global.world.gather(this_rank, send) {
            desc.sbuf_mut()[..chunklen].copy_from_slice(&chunk);
            got_chunk = true;
        }
    }
    desc.filcurb += strcnt;
    desc.filtail += strcnt;

    if !got_chunk {
        return FlushPlan {
            pos: 0,
            payload: Vec::new(),
            should_write: false,
        };
    }
    let period = strcnt * strcnt;
    let nth = filcurb_before / period;
    let wblks = nth * period + strcnt * u64::from(global.frank);
    FlushPlan {
        pos: wblks * strsize as u64,
        payload: desc.sbuf()[..chunklen].to_vec(),
        should_write: true,
    }
}

/// Forwarder mode (`spec.md` §4.5(b)): one local-group gather per flush
/// (lanes is forced to 1), landing `strsize * lprocs` bytes on the
/// forwarder. Chunk ownership rotates over `forwarders` rather than
/// `nprocs` (`spec.md` §6), so successive rounds for forwarder `color`
/// land at `(round * forwarders + color) * (strsize * lprocs)`.
fn gather_for_flush_forwarder(global: &GlobalState, desc: &mut DescriptorState) -> FlushPlan {
    let strsize = desc.strsize;
    let lprocs = global.lprocs as u64;
    let strcnt = desc.strcnt as u64;

    let send = &desc.ubuf[0..strsize];
    let gathered = global.local_group.gather(0, send);

    desc.filcurb += strcnt;
    desc.filtail += strcnt;

    let Some(chunk) = gathered else {
        return FlushPlan {
            pos: 0,
            payload: Vec::new(),
            should_write: false,
        };
    };
    desc.sbuf_mut()[..chunk.len()].copy_from_slice(&chunk);

    let forwarders = u64::from(global.forwarders.unwrap_or(1));
    let round = desc.filtail / strcnt - 1;
    let wblks_bytes = (round * forwarders + u64::from(global.color)) * lprocs * strsize as u64;

    FlushPlan {
        pos: wblks_bytes,
        payload: chunk,
        should_write: true,
    }
}

/// Computes this rank's disk read target for the next refill, without
/// issuing it. Mirrors [`gather_for_flush`]'s position arithmetic but for
/// the read-side "need data" boundary (`spec.md` §4.5 "Read path").
pub fn plan_refill(global: &GlobalState, desc: &DescriptorState) -> RefillPlan {
    if global.forwarder_mode() {
        plan_refill_forwarder(global, desc)
    } else {
        plan_refill_all_ranks(global, desc)
    }
}

fn plan_refill_all_ranks(global: &GlobalState, desc: &DescriptorState) -> RefillPlan {
    let strsize = desc.strsize;
    let strcnt = desc.strcnt as u64;
    let lanes = desc.lanes as u64;
    let chunklen = desc.chunklen;

    let period = strcnt * strcnt * lanes;
    let nth = desc.filcurb / period;
    let wblks = nth * period + (strcnt * lanes) * u64::from(global.frank);
    RefillPlan {
        pos: wblks * strsize as u64,
        len: chunklen * desc.lanes as usize,
        should_read: true,
    }
}

fn plan_refill_forwarder(global: &GlobalState, desc: &DescriptorState) -> RefillPlan {
    let strsize = desc.strsize;
    let strcnt = desc.strcnt as u64;
    let lprocs = global.lprocs as u64;
    let forwarders = u64::from(global.forwarders.unwrap_or(1));

    let round = desc.filcurb / strcnt;
    let pos = (round * forwarders + u64::from(global.color)) * lprocs * strsize as u64;
    RefillPlan {
        pos,
        len: strsize * global.lprocs as usize,
        should_read: global.is_forwarder,
    }
}

/// Scatters `disk_data` (whatever this rank's read produced, possibly
/// short at end of file) back into `desc.ubuf`, and advances `filcurb`.
/// Returns `bufend`: the number of whole stripes the read actually
/// produced, for the caller to use as the short-read cutoff (`spec.md` §3:
/// "records `actual_bytes / strcnt`").
pub fn scatter_after_read(global: &GlobalState, desc: &mut DescriptorState, disk_data: &[u8]) -> u32 {
    let strsize = desc.strsize;
    let strcnt = desc.strcnt as u64;

    if global.forwarder_mode() {
        let send = global.is_forwarder.then_some(disk_data);
        let recv = global.local_group.scatter(0, send, strsize);
        desc.ubuf[0..strsize].copy_from_slice(&recv);
        desc.filcurb += strcnt;
        let produced = disk_data.len() as u64 / strsize as u64;
        u32::try_from(produced.min(global.lprocs as u64)).unwrap_or(0)
    } else {
        let chunklen = desc.chunklen;
        let lanes = desc.lanes as usize;
        // Scatter is the dual of gather: every rank receives its own
        // stripe from whichever rank was root for that lane/offset.
        let mut produced_stripes = 0u64;
        for j in 0..(lanes * global.nprocs as usize) {
            let this_rank = (j / lanes) as u32;
            let lane_idx = j % lanes;
            let send = (global.rank == this_rank).then(|| {
                let start = lane_idx * chunklen;
                let end = (start + chunklen).min(disk_data.len());
                if start < disk_data.len() {
                    disk_data[start..end].to_vec()
                } else {
                    Vec::new()
                }
            });
            let recv = global.world.scatter(this_rank, send.as_deref(), strsize);
            let my_slot = j * strsize;
            if my_slot + strsize <= desc.ubuf.len() {
                desc.ubuf[my_slot..my_slot + strsize].copy_from_slice(&recv);
            }
            if global.rank == this_rank {
                let lane_start = lane_idx * chunklen;
                if lane_start < disk_data.len() {
                    produced_stripes += 1;
                }
            }
        }
        desc.filcurb += strcnt * desc.lanes as u64;
        u32::try_from(produced_stripes).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StatGranularity};
    use crate::group::FakeGroup;
    use std::sync::Arc;
    use std::thread;

    fn test_config(forwarders: Option<u32>, lanes: u32) -> Config {
        Config {
            care_path: "/care".into(),
            disabled: false,
            debug: Default::default(),
            confirm_banner: false,
            forwarders,
            lanes,
            worker_enabled: false,
            trunc_enabled: false,
            stats: StatGranularity::Disabled,
            worker_join_timeout: std::time::Duration::from_secs(1),
        }
    }

    #[test]
    fn all_ranks_flush_produces_one_write_plan_per_rank() {
        let groups = FakeGroup::new_world(4);
        let strsize = 8usize;
        let results: Vec<(u64, bool)> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|g| {
                    scope.spawn(move || {
                        let rank = g.rank();
                        let config = test_config(None, 1);
                        let global = GlobalState::new(Arc::new(g), &config).unwrap();
                        let mut desc =
                            DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
                        desc.init_geometry(strsize, global.nprocs, global.lanes, u64::from(global.frank), false);
                        for _ in 0..desc.bufcount_target {
                            desc.stage_write(&vec![rank as u8; strsize]).unwrap();
                        }
                        assert!(desc.ready_to_flush());
                        let plan = gather_for_flush(&global, &mut desc);
                        (plan.pos, plan.should_write)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // Every rank ends up the root of exactly one gather (lanes=1), so
        // every rank has a write to issue.
        assert!(results.iter().all(|&(_, should_write)| should_write));
        let mut positions: Vec<u64> = results.iter().map(|&(pos, _)| pos).collect();
        positions.sort_unstable();
        positions.dedup();
        assert_eq!(positions.len(), 4, "each rank must own a distinct disk block");
    }

    #[test]
    fn forwarder_mode_only_forwarder_writes() {
        let groups = FakeGroup::new_world(4);
        let strsize = 8usize;
        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|g| {
                    scope.spawn(move || {
                        let rank = g.rank();
                        let config = test_config(Some(2), 4);
                        let global = GlobalState::new(Arc::new(g), &config).unwrap();
                        let mut desc =
                            DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
                        desc.init_geometry(strsize, global.nprocs, global.lanes, u64::from(global.frank), true);
                        desc.stage_write(&vec![rank as u8; strsize]).unwrap();
                        assert!(desc.ready_to_flush());
                        let plan = gather_for_flush(&global, &mut desc);
                        plan.should_write
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // Only ranks 0 and 2 (lrank == 0 within each 2-rank local group) write.
        assert_eq!(results.iter().filter(|&&w| w).count(), 2);
    }

    #[test]
    fn forwarder_mode_tail_flush_is_a_no_op_when_nothing_staged() {
        let groups = FakeGroup::new_world(4);
        let strsize = 8usize;
        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|g| {
                    scope.spawn(move || {
                        let rank = g.rank();
                        let config = test_config(Some(2), 4);
                        let global = GlobalState::new(Arc::new(g), &config).unwrap();
                        let mut desc =
                            DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
                        desc.init_geometry(strsize, global.nprocs, global.lanes, u64::from(global.frank), true);
                        desc.stage_write(&vec![rank as u8; strsize]).unwrap();
                        let flushed = gather_for_flush(&global, &mut desc);
                        assert!(flushed.should_write);
                        desc.reset_after_flush();
                        // Nothing staged since the flush above: a close
                        // reaching the tail-flush path now must not resend
                        // the stale `ubuf` contents.
                        let tail = gather_for_tail_flush(&global, &mut desc);
                        tail.should_write
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|&should_write| !should_write));
    }

    #[test]
    fn roundtrip_write_then_read_recovers_original_stripes() {
        let strsize = 4usize;
        let nprocs = 3u32;
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        let write_groups = FakeGroup::new_world(nprocs);
        thread::scope(|scope| {
            for g in write_groups {
                let path = path.clone();
                scope.spawn(move || {
                    let rank = g.rank();
                    let config = test_config(None, 1);
                    let global = GlobalState::new(Arc::new(g), &config).unwrap();
                    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
                    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
                    let mut desc = DescriptorState::managed(fd, "/care/a".into(), 0, 0, false);
                    desc.init_geometry(strsize, global.nprocs, global.lanes, u64::from(global.frank), false);
                    desc.stage_write(&vec![rank as u8; strsize]).unwrap();
                    let plan = gather_for_flush(&global, &mut desc);
                    if plan.should_write {
                        crate::diskio::pwrite_all(fd, &plan.payload, plan.pos).unwrap();
                    }
                });
            }
        });

        let mut on_disk = vec![0u8; strsize * nprocs as usize];
        {
            use std::io::Read;
            let mut f = std::fs::File::open(&path).unwrap();
            f.read_exact(&mut on_disk).unwrap();
        }
        for r in 0..nprocs as usize {
            assert!(on_disk[r * strsize..(r + 1) * strsize].iter().all(|&b| b == r as u8));
        }
    }
}
