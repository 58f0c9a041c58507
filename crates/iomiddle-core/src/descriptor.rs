//! Per-descriptor state (C3): mode, buffers, file-view cursors, and the
//! process-wide descriptor table.
//!
//! Grounded on `spec.md` §3's `DescriptorState`/`GlobalState` field lists
//! and on `oxidized-fuse/src/handles.rs` for the *shape* of a handle-table
//! type (one struct per open handle, a table keyed by descriptor id, a
//! colocated test module exercising every transition) — but not its
//! storage: `handles.rs` backs its table with `dashmap::DashMap` because
//! FUSE handles are opened and closed concurrently from many kernel
//! request threads, while `spec.md` invariant 5 makes this table
//! effectively single-writer (the one application execution context per
//! process). A `DashMap` here would buy nothing and hide that invariant,
//! so the table is a plain `Mutex<Vec<Option<DescriptorState>>>` sized
//! once from the process's file descriptor limit, mirroring the original's
//! `getrlimit(RLIMIT_NOFILE, ...)` call in `_myhijack_init`.

use std::sync::Mutex;

use nix::sys::resource::{getrlimit, Resource};

use crate::error::{MiddlewareError, Result};
use crate::stats::DescriptorStats;

/// Read/write mode of a managed descriptor. `spec.md` §3: "set on first
/// data operation; any later opposite operation is fatal."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Unknown,
    Read,
    Write,
}

/// State attached to one managed (or explicitly unmanaged) file descriptor.
///
/// Fields mirror `spec.md` §3 one-for-one; the C `union` of bitfields
/// (`notfirst`, `frstrwcall`, `rwmode`, `dirty`, `trunc`) becomes plain
/// `bool`/enum fields — this is not a size-constrained kernel struct.
#[derive(Debug)]
pub struct DescriptorState {
    pub iofd: i32,
    pub path: String,
    pub flags: i32,
    pub mode: u32,
    pub managed: bool,
    pub rwmode: RwMode,

    /// Set once stripe geometry has been established by [`DescriptorState::init_geometry`].
    pub notfirst: bool,
    /// Set until the first data transfer through this descriptor has begun;
    /// used to tolerate the asynchronous worker's returning 0 on its first
    /// call (`spec.md` §8 property 6: "flush 0 always returns 0").
    pub frstrwcall: bool,
    /// True if the application opened with truncate semantics.
    pub trunc: bool,

    pub strsize: usize,
    /// Stripes per chunk; equal to the process count in all-ranks mode, or
    /// to the global rank count in forwarder mode (chunk ownership still
    /// rotates over `nprocs` stripes per `spec.md` §6's layout rule).
    pub strcnt: u32,
    pub chunklen: usize,

    pub lanes: u32,
    /// Target value of `bufcount` that triggers a flush. `lanes * strcnt`
    /// in all-ranks mode, forced to `1` in forwarder mode (`spec.md` §4.5).
    pub bufcount_target: u32,
    pub bufcount: u32,
    /// Read path only: number of stripes the last disk read actually
    /// produced, for end-of-file short-read detection. Never compared
    /// against `bufcount` (`SPEC_FULL.md` §9, open question 1).
    pub bufend: u32,

    pub ubuf: Vec<u8>,
    pub dbuf: [Vec<u8>; 2],
    /// Index into `dbuf` that `sbuf` currently aliases.
    pub tiktok: usize,

    pub filpos: u64,
    pub filcurb: u64,
    pub filtail: u64,

    pub dirty: bool,

    pub stats: DescriptorStats,
}

impl DescriptorState {
    /// Descriptor state for a file the path filter did not match: every
    /// operation on it must bypass to the unmanaged variant.
    pub fn unmanaged(iofd: i32) -> Self {
        DescriptorState {
            iofd,
            path: String::new(),
            flags: 0,
            mode: 0,
            managed: false,
            rwmode: RwMode::Unknown,
            notfirst: false,
            frstrwcall: true,
            trunc: false,
            strsize: 0,
            strcnt: 0,
            chunklen: 0,
            lanes: 1,
            bufcount_target: 0,
            bufcount: 0,
            bufend: 0,
            ubuf: Vec::new(),
            dbuf: [Vec::new(), Vec::new()],
            tiktok: 0,
            filpos: 0,
            filcurb: 0,
            filtail: 0,
            dirty: false,
            stats: DescriptorStats::default(),
        }
    }

    /// Descriptor state for a newly opened managed file, per `spec.md`
    /// §4.3: zero-initialized except `iofd`, `flags`, `mode`, `path`,
    /// `managed=true`, `trunc`, and `rwmode=unknown`.
    pub fn managed(iofd: i32, path: String, flags: i32, mode: u32, trunc: bool) -> Self {
        DescriptorState {
            managed: true,
            trunc,
            ..Self::unmanaged(iofd)
        }
        .with_path(path, flags, mode)
    }

    fn with_path(mut self, path: String, flags: i32, mode: u32) -> Self {
        self.path = path;
        self.flags = flags;
        self.mode = mode;
        self
    }

    /// The system-side buffer: always `dbuf[tiktok]` (`spec.md` invariant 4).
    pub fn sbuf(&self) -> &[u8] {
        &self.dbuf[self.tiktok]
    }

    pub fn sbuf_mut(&mut self) -> &mut [u8] {
        &mut self.dbuf[self.tiktok]
    }

    /// Establishes stripe geometry on the first data operation or the first
    /// non-trivial `lseek` (`spec.md` §4.4). Idempotent guard: callers must
    /// check `notfirst` first, since a second call would silently resize
    /// live buffers out from under in-flight data.
    pub fn init_geometry(&mut self, strsize: usize, strcnt: u32, lanes: u32, frank: u64, forwarder_mode: bool) {
        self.strsize = strsize;
        self.strcnt = strcnt;
        self.chunklen = strsize * strcnt as usize;
        self.lanes = if forwarder_mode { 1 } else { lanes };
        self.bufcount_target = if forwarder_mode { 1 } else { self.lanes * strcnt };
        self.ubuf = vec![0u8; self.chunklen * self.lanes as usize];
        self.dbuf = [
            vec![0u8; self.chunklen * self.lanes as usize],
            vec![0u8; self.chunklen * self.lanes as usize],
        ];
        self.tiktok = 0;
        self.filcurb = frank;
        self.filtail = frank;
        self.notfirst = true;
    }

    /// Enforces `spec.md` invariant: the first data operation fixes
    /// `rwmode`; any later opposite operation is a contract violation.
    pub fn begin_operation(&mut self, mode: RwMode) -> Result<()> {
        match self.rwmode {
            RwMode::Unknown => {
                self.rwmode = mode;
                Ok(())
            }
            current if current == mode => Ok(()),
            _ => Err(MiddlewareError::ContractViolation(format!(
                "descriptor {} already in {:?} mode, cannot switch to {:?}",
                self.iofd, self.rwmode, mode
            ))),
        }
    }

    /// Appends one stripe to the user buffer (`spec.md` §4.4 "Writing").
    /// `data.len()` must equal `strsize` exactly.
    pub fn stage_write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.strsize {
            return Err(MiddlewareError::ContractViolation(format!(
                "write length {} does not match stripe size {}",
                data.len(),
                self.strsize
            )));
        }
        let bufpos = self.bufcount as usize * self.strsize;
        self.ubuf[bufpos..bufpos + self.strsize].copy_from_slice(data);
        self.bufcount += 1;
        self.dirty = true;
        self.filpos += self.strsize as u64;
        Ok(())
    }

    /// Copies one stripe out of the user buffer into the application's
    /// buffer (`spec.md` §4.4 "Reading"). `out.len()` must equal `strsize`.
    pub fn consume_read(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.strsize {
            return Err(MiddlewareError::ContractViolation(format!(
                "read length {} does not match stripe size {}",
                out.len(),
                self.strsize
            )));
        }
        let bufpos = self.bufcount as usize * self.strsize;
        out.copy_from_slice(&self.ubuf[bufpos..bufpos + self.strsize]);
        self.bufcount += 1;
        self.filpos += self.strsize as u64;
        Ok(())
    }

    pub fn ready_to_flush(&self) -> bool {
        self.bufcount >= self.bufcount_target
    }

    /// Whether the lane has stripes staged that a read must first consume
    /// before the next disk fetch; bufend==0 with bufcount==0 means the
    /// lane is fully drained.
    pub fn needs_refill(&self) -> bool {
        self.bufcount == 0
    }

    /// Resets staging state after a flush completes and flips the double
    /// buffer, per `spec.md` §4.4: "Post-flush, bufcount=0, bufpos=0,
    /// dirty=false, and the double buffer is swapped."
    pub fn reset_after_flush(&mut self) {
        self.bufcount = 0;
        self.dirty = false;
        self.tiktok ^= 1;
    }
}

/// Process-wide table of descriptor state, sized once from
/// `RLIMIT_NOFILE`. Descriptors 0, 1, and 2 are pre-marked unmanaged, per
/// `spec.md` §4.3.
pub struct FdTable {
    slots: Mutex<Vec<Option<DescriptorState>>>,
}

impl FdTable {
    /// Sizes the table from the process's soft `RLIMIT_NOFILE`, falling
    /// back to a conservative default if the limit cannot be read (e.g.
    /// running under a sandboxed test harness).
    pub fn new() -> Self {
        let capacity = getrlimit(Resource::RLIMIT_NOFILE)
            .ok()
            .and_then(|(soft, _hard)| usize::try_from(soft).ok())
            .unwrap_or(1024);
        let mut slots: Vec<Option<DescriptorState>> = (0..capacity).map(|_| None).collect();
        for fd in 0..3.min(capacity as i32) {
            slots[fd as usize] = Some(DescriptorState::unmanaged(fd));
        }
        FdTable {
            slots: Mutex::new(slots),
        }
    }

    pub fn insert(&self, fd: i32, state: DescriptorState) {
        let mut slots = self.slots.lock().unwrap();
        let idx = fd as usize;
        if idx >= slots.len() {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(state);
    }

    pub fn remove(&self, fd: i32) -> Option<DescriptorState> {
        let mut slots = self.slots.lock().unwrap();
        slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn with<R>(&self, fd: i32, f: impl FnOnce(Option<&mut DescriptorState>) -> R) -> R {
        let mut slots = self.slots.lock().unwrap();
        f(slots.get_mut(fd as usize).and_then(Option::as_mut))
    }

    pub fn contains(&self, fd: i32) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.get(fd as usize).is_some_and(Option::is_some)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_descriptors_are_pre_marked_unmanaged() {
        let table = FdTable::new();
        table.with(0, |state| assert!(!state.unwrap().managed));
        table.with(1, |state| assert!(!state.unwrap().managed));
        table.with(2, |state| assert!(!state.unwrap().managed));
    }

    #[test]
    fn insert_and_remove_roundtrip() {
        let table = FdTable::new();
        let state = DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
        table.insert(10, state);
        assert!(table.contains(10));
        let removed = table.remove(10).unwrap();
        assert_eq!(removed.path, "/care/a");
        assert!(!table.contains(10));
    }

    #[test]
    fn begin_operation_fixes_mode_then_rejects_opposite() {
        let mut state = DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
        state.begin_operation(RwMode::Write).unwrap();
        state.begin_operation(RwMode::Write).unwrap();
        let err = state.begin_operation(RwMode::Read).unwrap_err();
        assert!(matches!(err, MiddlewareError::ContractViolation(_)));
    }

    #[test]
    fn stage_write_rejects_wrong_length() {
        let mut state = DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
        state.init_geometry(4096, 4, 1, 0, false);
        let err = state.stage_write(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, MiddlewareError::ContractViolation(_)));
    }

    #[test]
    fn stage_write_accumulates_until_target_then_flush_resets() {
        let mut state = DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
        state.init_geometry(8, 4, 1, 0, false);
        assert_eq!(state.bufcount_target, 4);
        for _ in 0..4 {
            state.stage_write(&[7u8; 8]).unwrap();
        }
        assert!(state.ready_to_flush());
        let old_tiktok = state.tiktok;
        state.reset_after_flush();
        assert_eq!(state.bufcount, 0);
        assert!(!state.dirty);
        assert_ne!(state.tiktok, old_tiktok);
    }

    #[test]
    fn forwarder_mode_forces_single_stripe_lane() {
        let mut state = DescriptorState::managed(10, "/care/a".into(), 0, 0, false);
        state.init_geometry(8, 4, 3, 2, true);
        assert_eq!(state.lanes, 1);
        assert_eq!(state.bufcount_target, 1);
        assert_eq!(state.filcurb, 2);
        assert_eq!(state.filtail, 2);
    }
}
