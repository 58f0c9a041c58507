//! Abstraction over the message-passing primitive `spec.md` §1 calls an
//! external collaborator, plus two implementations: a real MPI-backed group
//! and an in-process fake used by tests.
//!
//! Grounded on `other_examples/manifests/maetin0324-async-ior`, which
//! depends on `mpi = "0.8"` (rsmpi) for the identical purpose (collective
//! I/O over `MPI_COMM_WORLD`). The trait itself follows `spec.md` §9's own
//! suggestion: "an alternate strategy is explicit delegation through a
//! provided function table (dependency injection)" — applied for
//! testability, while `MpiGroup` still talks to a real communicator in
//! production.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};

/// The process-group primitive the middleware core needs: size, rank,
/// barrier, gather/scatter around a root, two allreduce reductions, and
/// subgroup construction by color.
pub trait CollectiveGroup: Send + Sync {
    fn size(&self) -> u32;
    fn rank(&self) -> u32;

    fn barrier(&self);

    /// Every rank contributes `value`; every rank receives the value
    /// contributed by `root`.
    fn broadcast_u64(&self, root: u32, value: u64) -> u64;

    fn all_reduce_sum_u64(&self, value: u64) -> u64;
    fn all_reduce_max_u64(&self, value: u64) -> u64;

    /// Every rank contributes `send`. On `root`, returns the concatenation
    /// ordered by rank; on every other rank, returns `None`.
    fn gather(&self, root: u32, send: &[u8]) -> Option<Vec<u8>>;

    /// `root` contributes `send` (must be exactly `recv_len * size()` bytes);
    /// every rank, including `root`, receives its `recv_len`-byte slice.
    /// Non-root callers pass `send: None`.
    fn scatter(&self, root: u32, send: Option<&[u8]>, recv_len: usize) -> Vec<u8>;

    /// Splits this group into subgroups sharing the same `color`, mirroring
    /// `MPI_Comm_split`. Ranks within the returned group are ordered by
    /// ascending global rank.
    fn split_by_color(&self, color: u32) -> Arc<dyn CollectiveGroup>;
}

// ---------------------------------------------------------------------
// Real group, backed by the `mpi` crate.
// ---------------------------------------------------------------------

#[cfg(feature = "mpi-group")]
mod mpi_group {
    use super::CollectiveGroup;
    use mpi::collective::SystemOperation;
    use mpi::topology::{Color, SimpleCommunicator};
    use mpi::traits::*;
    use std::sync::Arc;

    /// `CollectiveGroup` backed by a real `SimpleCommunicator`.
    ///
    /// `MpiGroup::world()` calls `mpi::initialize()` once and intentionally
    /// leaks the returned `Universe`: `MPI_Finalize` is expected to run at
    /// process exit via the MPI runtime's own atexit hook (most MPI
    /// implementations install one), not at the drop point of a Rust value
    /// this crate has no good place to hold for the whole process lifetime.
    pub struct MpiGroup {
        comm: SimpleCommunicator,
    }

    impl MpiGroup {
        pub fn world() -> Self {
            let universe = mpi::initialize()
                .expect("MPI_Init failed; is this process launched under mpirun?");
            let comm = universe.world();
            std::mem::forget(universe);
            MpiGroup { comm }
        }

        fn from_comm(comm: SimpleCommunicator) -> Self {
            MpiGroup { comm }
        }
    }

    impl CollectiveGroup for MpiGroup {
        fn size(&self) -> u32 {
            self.comm.size() as u32
        }

        fn rank(&self) -> u32 {
            self.comm.rank() as u32
        }

        fn barrier(&self) {
            self.comm.barrier();
        }

        fn broadcast_u64(&self, root: u32, value: u64) -> u64 {
            let mut buf = value;
            self.comm.process_at_rank(root as i32).broadcast_into(&mut buf);
            buf
        }

        fn all_reduce_sum_u64(&self, value: u64) -> u64 {
            let mut out = 0u64;
            self.comm.all_reduce_into(&value, &mut out, SystemOperation::sum());
            out
        }

        fn all_reduce_max_u64(&self, value: u64) -> u64 {
            let mut out = 0u64;
            self.comm.all_reduce_into(&value, &mut out, SystemOperation::max());
            out
        }

        fn gather(&self, root: u32, send: &[u8]) -> Option<Vec<u8>> {
            let root_process = self.comm.process_at_rank(root as i32);
            if self.rank() == root {
                let mut recv = vec![0u8; send.len() * self.size() as usize];
                root_process.gather_into_root(send, &mut recv);
                Some(recv)
            } else {
                root_process.gather_into(send);
                None
            }
        }

        fn scatter(&self, root: u32, send: Option<&[u8]>, recv_len: usize) -> Vec<u8> {
            let root_process = self.comm.process_at_rank(root as i32);
            let mut recv = vec![0u8; recv_len];
            if self.rank() == root {
                let send = send.expect("scatter root must provide a send buffer");
                root_process.scatter_into_root(send, &mut recv);
            } else {
                root_process.scatter_into(&mut recv);
            }
            recv
        }

        fn split_by_color(&self, color: u32) -> Arc<dyn CollectiveGroup> {
            let split = self
                .comm
                .split_by_color(Color::with_value(color as i32))
                .expect("MPI_Comm_split failed");
            Arc::new(MpiGroup::from_comm(split))
        }
    }
}

#[cfg(feature = "mpi-group")]
pub use mpi_group::MpiGroup;

// ---------------------------------------------------------------------
// In-process fake, used by unit and scenario tests.
// ---------------------------------------------------------------------

struct RoundState {
    round: u64,
    contributions: Vec<Option<Box<dyn Any + Send>>>,
    outputs: Vec<Option<Box<dyn Any + Send>>>,
    arrived: usize,
}

struct FakeGroupShared {
    size: usize,
    state: Mutex<RoundState>,
    cond: Condvar,
}

impl FakeGroupShared {
    fn new(size: usize) -> Self {
        FakeGroupShared {
            size,
            state: Mutex::new(RoundState {
                round: 0,
                contributions: (0..size).map(|_| None).collect(),
                outputs: (0..size).map(|_| None).collect(),
                arrived: 0,
            }),
            cond: Condvar::new(),
        }
    }
}

/// An in-memory [`CollectiveGroup`] that shuttles gather/scatter/reduce
/// calls between simulated ranks sharing one process, via a single
/// rendezvous-barrier-and-compute primitive. Intended for tests driving
/// several simulated ranks from separate threads (e.g. `std::thread::scope`),
/// not for production use.
pub struct FakeGroup {
    rank: u32,
    shared: Arc<FakeGroupShared>,
}

impl FakeGroup {
    /// Builds `size` handles sharing one world group, one per simulated
    /// rank, in rank order.
    pub fn new_world(size: u32) -> Vec<FakeGroup> {
        let shared = Arc::new(FakeGroupShared::new(size as usize));
        (0..size)
            .map(|rank| FakeGroup {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Blocks until every rank in the group has contributed a value for the
    /// current round, then runs `compute` exactly once (on whichever thread
    /// happens to arrive last) to turn the per-rank contributions into
    /// per-rank outputs, then returns this rank's output.
    ///
    /// This is the single synchronization primitive behind every other
    /// method: gather, scatter, broadcast, allreduce, barrier, and
    /// split-by-color all reduce to "contribute, compute once, fan out".
    fn rendezvous<T, R>(&self, contribution: T, compute: impl FnOnce(Vec<T>) -> Vec<R>) -> R
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self.shared.state.lock().unwrap();
        let my_round = guard.round;
        guard.contributions[self.rank as usize] = Some(Box::new(contribution));
        guard.arrived += 1;

        if guard.arrived == self.shared.size {
            let taken: Vec<T> = guard
                .contributions
                .iter_mut()
                .map(|slot| {
                    *slot
                        .take()
                        .expect("every rank contributed before compute runs")
                        .downcast::<T>()
                        .expect("rendezvous contribution type mismatch")
                })
                .collect();
            let outputs = compute(taken);
            guard.outputs = outputs
                .into_iter()
                .map(|o| Some(Box::new(o) as Box<dyn Any + Send>))
                .collect();
            guard.arrived = 0;
            guard.round += 1;
            self.shared.cond.notify_all();
        } else {
            while guard.round == my_round {
                guard = self.shared.cond.wait(guard).unwrap();
            }
        }

        *guard.outputs[self.rank as usize]
            .take()
            .expect("every rank's output was produced by compute")
            .downcast::<R>()
            .expect("rendezvous output type mismatch")
    }
}

impl CollectiveGroup for FakeGroup {
    fn size(&self) -> u32 {
        self.shared.size as u32
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn barrier(&self) {
        let size = self.shared.size;
        self.rendezvous((), move |_: Vec<()>| vec![(); size]);
    }

    fn broadcast_u64(&self, root: u32, value: u64) -> u64 {
        let size = self.shared.size;
        self.rendezvous(value, move |contributions: Vec<u64>| {
            vec![contributions[root as usize]; size]
        })
    }

    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        let size = self.shared.size;
        self.rendezvous(value, move |contributions: Vec<u64>| {
            vec![contributions.iter().sum::<u64>(); size]
        })
    }

    fn all_reduce_max_u64(&self, value: u64) -> u64 {
        let size = self.shared.size;
        self.rendezvous(value, move |contributions: Vec<u64>| {
            vec![contributions.into_iter().max().unwrap_or(0); size]
        })
    }

    fn gather(&self, root: u32, send: &[u8]) -> Option<Vec<u8>> {
        let size = self.shared.size;
        let is_root = self.rank == root;
        let result = self.rendezvous(send.to_vec(), move |contributions: Vec<Vec<u8>>| {
            let concatenated: Vec<u8> = contributions.into_iter().flatten().collect();
            (0..size)
                .map(|r| if r == root { concatenated.clone() } else { Vec::new() })
                .collect::<Vec<_>>()
        });
        is_root.then_some(result)
    }

    fn scatter(&self, root: u32, send: Option<&[u8]>, recv_len: usize) -> Vec<u8> {
        let size = self.shared.size;
        let contribution = send.map(<[u8]>::to_vec);
        self.rendezvous(contribution, move |contributions: Vec<Option<Vec<u8>>>| {
            let full = contributions[root as usize]
                .clone()
                .expect("scatter root must provide a send buffer");
            (0..size)
                .map(|r| {
                    let start = r as usize * recv_len;
                    full[start..start + recv_len].to_vec()
                })
                .collect::<Vec<_>>()
        })
    }

    fn split_by_color(&self, color: u32) -> Arc<dyn CollectiveGroup> {
        let (shared, local_rank) = self.rendezvous(color, move |colors: Vec<u32>| {
            let mut groups: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for (r, &c) in colors.iter().enumerate() {
                groups.entry(c).or_default().push(r as u32);
            }
            let shared_by_color: HashMap<u32, Arc<FakeGroupShared>> = groups
                .iter()
                .map(|(&c, members)| (c, Arc::new(FakeGroupShared::new(members.len()))))
                .collect();
            colors
                .iter()
                .enumerate()
                .map(|(r, c)| {
                    let members = &groups[c];
                    let local_rank = members.iter().position(|&m| m == r as u32).unwrap() as u32;
                    (shared_by_color[c].clone(), local_rank)
                })
                .collect::<Vec<_>>()
        });
        Arc::new(FakeGroup {
            rank: local_rank,
            shared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn barrier_releases_every_rank() {
        let groups = FakeGroup::new_world(4);
        thread::scope(|scope| {
            for g in &groups {
                scope.spawn(move || g.barrier());
            }
        });
    }

    #[test]
    fn all_reduce_sum_matches_every_rank() {
        let groups = FakeGroup::new_world(4);
        let results: Vec<u64> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| scope.spawn(move || g.all_reduce_sum_u64(u64::from(g.rank()) + 1)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|&r| r == 1 + 2 + 3 + 4));
    }

    #[test]
    fn all_reduce_max_matches_every_rank() {
        let groups = FakeGroup::new_world(3);
        let results: Vec<u64> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| scope.spawn(move || g.all_reduce_max_u64(u64::from(g.rank()) * 10)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|&r| r == 20));
    }

    #[test]
    fn broadcast_delivers_roots_value() {
        let groups = FakeGroup::new_world(3);
        let results: Vec<u64> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    let contribution = if g.rank() == 1 { 777 } else { 0 };
                    scope.spawn(move || g.broadcast_u64(1, contribution))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![777, 777, 777]);
    }

    #[test]
    fn gather_concatenates_in_rank_order_at_root_only() {
        let groups = FakeGroup::new_world(3);
        let results: Vec<Option<Vec<u8>>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    let payload = vec![g.rank() as u8; 2];
                    scope.spawn(move || g.gather(0, &payload))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], Some(vec![0, 0, 1, 1, 2, 2]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn scatter_distributes_equal_slices_from_root() {
        let groups = FakeGroup::new_world(4);
        let results: Vec<Vec<u8>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    let send: Option<Vec<u8>> = (g.rank() == 2).then(|| (0..8).collect());
                    scope.spawn(move || g.scatter(2, send.as_deref(), 2))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6, 7]]);
    }

    #[test]
    fn split_by_color_partitions_and_renumbers_ranks() {
        let groups = FakeGroup::new_world(4);
        // colors: rank 0,1 -> color 0 ; rank 2,3 -> color 1
        let split: Vec<Arc<dyn CollectiveGroup>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    let color = g.rank() / 2;
                    scope.spawn(move || g.split_by_color(color))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(split[0].size(), 2);
        assert_eq!(split[0].rank(), 0);
        assert_eq!(split[1].rank(), 1);
        assert_eq!(split[2].rank(), 0);
        assert_eq!(split[3].rank(), 1);
    }
}
