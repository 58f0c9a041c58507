//! Process-wide state (`spec.md` §3 `GlobalState`): group topology, the
//! optional forwarder subgrouping, and the descriptor table.
//!
//! Grounded on `spec.md` §3/§4.5 for the field list and the subgroup
//! construction rule, and on `oxidized-fuse`'s single process-wide
//! `OnceLock`-held state object for the *lifecycle* (initialized once by
//! the shim's one-shot initializer, torn down at process exit).

use std::sync::Arc;

use crate::config::{Config, StatGranularity};
use crate::descriptor::FdTable;
use crate::error::Result;
use crate::group::CollectiveGroup;

/// Process-wide topology and configuration, built once at middleware
/// initialization time from a [`CollectiveGroup`] and a [`Config`].
pub struct GlobalState {
    pub world: Arc<dyn CollectiveGroup>,
    pub nprocs: u32,
    pub rank: u32,

    /// Configured forwarder count; `None` means all-ranks mode (every rank
    /// forwards, the degenerate case `spec.md` §3 calls out for `0`).
    pub forwarders: Option<u32>,

    /// Subgroup sharing a forwarder. Equal to `world` in all-ranks mode, so
    /// callers never need to branch on whether forwarding is enabled.
    pub local_group: Arc<dyn CollectiveGroup>,
    pub lrank: u32,
    pub lprocs: u32,
    pub color: u32,

    /// Subgroup containing only forwarders, used for the statistics
    /// roll-up (`spec.md` §3). Equal to `world` in all-ranks mode.
    pub forwarder_group: Arc<dyn CollectiveGroup>,
    pub is_forwarder: bool,

    /// This process's position in the stripe cadence on disk: `rank` in
    /// non-forwarder mode, `color` otherwise.
    pub frank: u32,

    pub lanes: u32,
    pub care_root: String,
    pub trunc_enabled: bool,
    pub worker_enabled: bool,
    pub stats_granularity: StatGranularity,

    pub fd_table: FdTable,
}

impl GlobalState {
    /// Builds global state from a real or fake process group plus parsed
    /// configuration. Validates `forwarders` divides `nprocs` exactly
    /// (`spec.md` §4.5: "the exact division must be exact (fatal
    /// otherwise)").
    pub fn new(world: Arc<dyn CollectiveGroup>, config: &Config) -> Result<Self> {
        let nprocs = world.size();
        let rank = world.rank();
        config.validate_against(nprocs)?;

        let (local_group, lrank, lprocs, color, forwarder_group, is_forwarder, frank) =
            match config.forwarders {
                None => (world.clone(), rank, nprocs, rank, world.clone(), true, rank),
                Some(forwarders) => {
                    let lprocs = nprocs / forwarders;
                    let color = rank / lprocs;
                    let local_group = world.split_by_color(color);
                    let lrank = local_group.rank();
                    let is_forwarder = lrank == 0;
                    // Two buckets: forwarders (color 0) and everyone else
                    // (color 1, unused beyond this split). Only the
                    // forwarder-side group is ever consulted for roll-up.
                    let forwarder_group = world.split_by_color(u32::from(!is_forwarder));
                    (local_group, lrank, lprocs, color, forwarder_group, is_forwarder, color)
                }
            };

        Ok(GlobalState {
            world,
            nprocs,
            rank,
            forwarders: config.forwarders,
            local_group,
            lrank,
            lprocs,
            color,
            forwarder_group,
            is_forwarder,
            frank,
            lanes: config.lanes,
            care_root: config.care_path.clone(),
            trunc_enabled: config.trunc_enabled,
            worker_enabled: config.worker_enabled,
            stats_granularity: config.stats,
            fd_table: FdTable::new(),
        })
    }

    pub fn forwarder_mode(&self) -> bool {
        self.forwarders.is_some()
    }
}
