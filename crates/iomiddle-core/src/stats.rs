//! Per-phase statistics (C9): call counts, byte counts, and timing,
//! aggregated first over the forwarder group and then onto rank 0.
//!
//! Grounded on `spec.md` §2/§3's "Statistics (optional): per-phase
//! cumulative, min, max time and byte counts" and the roll-up in §4.7's
//! sibling discussion of the forwarder group. The wire format is a flat
//! little-endian `u64` packing rather than `serde`, matching the rest of
//! this crate's choice to keep collective payloads as raw byte buffers the
//! way `spec.md`'s external message-passing primitive expects.

use std::time::Duration;

use crate::group::CollectiveGroup;

/// Cumulative/min/max counters for one phase (write, read, or flush).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStat {
    pub calls: u64,
    pub bytes: u64,
    pub time_ns_total: u64,
    pub time_ns_min: u64,
    pub time_ns_max: u64,
}

impl Default for PhaseStat {
    fn default() -> Self {
        PhaseStat {
            calls: 0,
            bytes: 0,
            time_ns_total: 0,
            time_ns_min: u64::MAX,
            time_ns_max: 0,
        }
    }
}

impl PhaseStat {
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.calls += 1;
        self.bytes += bytes;
        self.time_ns_total += ns;
        self.time_ns_min = self.time_ns_min.min(ns);
        self.time_ns_max = self.time_ns_max.max(ns);
    }

    /// Folds `other` into `self`, as the roll-up step does across ranks.
    pub fn merge(&mut self, other: &PhaseStat) {
        self.calls += other.calls;
        self.bytes += other.bytes;
        self.time_ns_total += other.time_ns_total;
        self.time_ns_min = self.time_ns_min.min(other.time_ns_min);
        self.time_ns_max = self.time_ns_max.max(other.time_ns_max);
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.calls.to_le_bytes());
        out.extend_from_slice(&self.bytes.to_le_bytes());
        out.extend_from_slice(&self.time_ns_total.to_le_bytes());
        out.extend_from_slice(&self.time_ns_min.to_le_bytes());
        out.extend_from_slice(&self.time_ns_max.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        let field = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        PhaseStat {
            calls: field(0),
            bytes: field(1),
            time_ns_total: field(2),
            time_ns_min: field(3),
            time_ns_max: field(4),
        }
    }

    const WIRE_LEN: usize = 8 * 5;
}

/// Statistics for one managed descriptor, one set per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorStats {
    pub write: PhaseStat,
    pub read: PhaseStat,
    pub flush: PhaseStat,
}

impl DescriptorStats {
    const WIRE_LEN: usize = PhaseStat::WIRE_LEN * 3;

    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        self.write.write_bytes(&mut out);
        self.read.write_bytes(&mut out);
        self.flush.write_bytes(&mut out);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        DescriptorStats {
            write: PhaseStat::read_bytes(&bytes[0..PhaseStat::WIRE_LEN]),
            read: PhaseStat::read_bytes(&bytes[PhaseStat::WIRE_LEN..PhaseStat::WIRE_LEN * 2]),
            flush: PhaseStat::read_bytes(&bytes[PhaseStat::WIRE_LEN * 2..PhaseStat::WIRE_LEN * 3]),
        }
    }

    fn merge(&mut self, other: &DescriptorStats) {
        self.write.merge(&other.write);
        self.read.merge(&other.read);
        self.flush.merge(&other.flush);
    }
}

/// Rolls local per-rank statistics up to rank 0, honoring `IOMIDDLE_STAT`'s
/// granularity: `PerForwarder` merges within each local group before the
/// final gather onto rank 0 of the forwarder group, `PerRank` gathers every
/// rank's raw numbers onto rank 0 unmerged. Returns `Some` only on the
/// process that ends up holding the aggregate (rank 0), `None` elsewhere.
pub fn rollup(
    local: DescriptorStats,
    granularity: crate::config::StatGranularity,
    local_group: &dyn CollectiveGroup,
    forwarder_group: Option<&dyn CollectiveGroup>,
) -> Option<Vec<DescriptorStats>> {
    use crate::config::StatGranularity;

    match granularity {
        StatGranularity::Disabled => None,
        StatGranularity::PerForwarder => {
            let gathered = local_group.gather(0, &local.to_bytes())?;
            if local_group.rank() != 0 {
                return None;
            }
            let merged = gathered
                .chunks(DescriptorStats::WIRE_LEN)
                .map(DescriptorStats::from_bytes)
                .fold(DescriptorStats::default(), |mut acc, s| {
                    acc.merge(&s);
                    acc
                });
            match forwarder_group {
                Some(fwd) => rollup_onto_rank0(merged, fwd),
                None => Some(vec![merged]),
            }
        }
        StatGranularity::PerRank => rollup_onto_rank0(local, local_group),
    }
}

fn rollup_onto_rank0(
    local: DescriptorStats,
    group: &dyn CollectiveGroup,
) -> Option<Vec<DescriptorStats>> {
    let gathered = group.gather(0, &local.to_bytes())?;
    (group.rank() == 0).then(|| {
        gathered
            .chunks(DescriptorStats::WIRE_LEN)
            .map(DescriptorStats::from_bytes)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn phase_stat_records_and_tracks_extrema() {
        let mut stat = PhaseStat::default();
        stat.record(4096, Duration::from_micros(10));
        stat.record(4096, Duration::from_micros(50));
        assert_eq!(stat.calls, 2);
        assert_eq!(stat.bytes, 8192);
        assert_eq!(stat.time_ns_min, 10_000);
        assert_eq!(stat.time_ns_max, 50_000);
    }

    #[test]
    fn roundtrip_through_wire_format() {
        let mut stats = DescriptorStats::default();
        stats.write.record(4096, Duration::from_micros(5));
        stats.read.record(2048, Duration::from_micros(3));
        let bytes = stats.to_bytes();
        assert_eq!(bytes.len(), DescriptorStats::WIRE_LEN);
        let back = DescriptorStats::from_bytes(&bytes);
        assert_eq!(back, stats);
    }

    #[test]
    fn per_rank_rollup_lands_on_rank_zero_only() {
        use crate::config::StatGranularity;
        use crate::group::FakeGroup;

        let groups = FakeGroup::new_world(3);
        let results: Vec<Option<Vec<DescriptorStats>>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    let mut local = DescriptorStats::default();
                    local.write.record(u64::from(g.rank()) + 1, Duration::from_micros(1));
                    scope.spawn(move || rollup(local, StatGranularity::PerRank, g, None))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_none());
        let agg = results[0].as_ref().unwrap();
        assert_eq!(agg.len(), 3);
        assert_eq!(agg[0].write.bytes, 1);
        assert_eq!(agg[2].write.bytes, 3);
    }
}
