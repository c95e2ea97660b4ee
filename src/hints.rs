//! # Partition Hints
//!
//! Adaptive, advisory per-partition statistics. Every discovery probe into a
//! partition records a hit (offers came back) or a miss (nothing there), and
//! the resulting ratio biases whether later searches bother probing that
//! partition at all.
//!
//! Hints are soft state: they are bounded, never authoritative, and peers
//! exchange them opportunistically by piggybacking snapshots on discovery
//! replies. A merged-in snapshot only ever adds counter weight.

use std::sync::Mutex;

use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Maximum tracked partitions before FIFO eviction starts.
const MAX_TRACKED_PARTITIONS: usize = 256;

/// Below this many samples a partition is always probed.
const MIN_SAMPLES: u64 = 8;

/// Partitions with a hit ratio under this floor are skipped...
const HIT_RATIO_FLOOR: f64 = 0.25;

/// ...except for an occasional exploratory probe, so a partition that went
/// cold can be rediscovered once suppliers return.
const EXPLORE_PROBABILITY: f64 = 0.10;

/// A single partition's counters, as exchanged between nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHint {
    pub resources: Resources,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Clone, Copy, Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

/// Bounded hit/miss store, shared by the discovery paths of one node.
#[derive(Default)]
pub struct PartitionHints {
    inner: Mutex<IndexMap<Resources, Counters>>,
}

impl PartitionHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a probe into `partition` returned offers.
    pub fn record_hit(&self, partition: &Resources) {
        self.update(partition, |c| c.hits = c.hits.saturating_add(1));
    }

    /// Records that a probe into `partition` came back empty.
    pub fn record_miss(&self, partition: &Resources) {
        self.update(partition, |c| c.misses = c.misses.saturating_add(1));
    }

    /// Whether a search should spend a probe on `partition`.
    ///
    /// Under-sampled partitions are always probed. Partitions whose observed
    /// hit ratio cleared [`HIT_RATIO_FLOOR`] are probed. Everything else gets
    /// an [`EXPLORE_PROBABILITY`] chance.
    pub fn should_probe(&self, partition: &Resources) -> bool {
        let counters = {
            let inner = self.inner.lock().expect("partition hints lock");
            match inner.get(partition) {
                Some(c) => *c,
                None => return true,
            }
        };

        let samples = counters.hits + counters.misses;
        if samples < MIN_SAMPLES {
            return true;
        }
        if counters.hits as f64 / samples as f64 >= HIT_RATIO_FLOOR {
            return true;
        }
        rand::thread_rng().gen_bool(EXPLORE_PROBABILITY)
    }

    /// Snapshot of all tracked partitions, for piggybacking on replies.
    pub fn snapshot(&self) -> Vec<PartitionHint> {
        let inner = self.inner.lock().expect("partition hints lock");
        inner
            .iter()
            .map(|(resources, c)| PartitionHint {
                resources: *resources,
                hits: c.hits,
                misses: c.misses,
            })
            .collect()
    }

    /// Folds a peer's snapshot into the local counters.
    pub fn merge(&self, remote: &[PartitionHint]) {
        for hint in remote {
            self.update(&hint.resources, |c| {
                c.hits = c.hits.saturating_add(hint.hits);
                c.misses = c.misses.saturating_add(hint.misses);
            });
        }
    }

    fn update(&self, partition: &Resources, apply: impl FnOnce(&mut Counters)) {
        let mut inner = self.inner.lock().expect("partition hints lock");

        // FIFO eviction: IndexMap keeps insertion order, so index 0 is
        // always the oldest tracked partition.
        while !inner.contains_key(partition) && inner.len() >= MAX_TRACKED_PARTITIONS {
            if inner.shift_remove_index(0).is_none() {
                break;
            }
        }

        apply(inner.entry(*partition).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsampled_partition_is_always_probed() {
        let hints = PartitionHints::new();
        assert!(hints.should_probe(&Resources::new(0, 1, 256)));
    }

    #[test]
    fn undersampled_partition_is_always_probed() {
        let hints = PartitionHints::new();
        let partition = Resources::new(0, 1, 256);
        for _ in 0..MIN_SAMPLES - 1 {
            hints.record_miss(&partition);
        }
        assert!(hints.should_probe(&partition));
    }

    #[test]
    fn healthy_partition_is_probed() {
        let hints = PartitionHints::new();
        let partition = Resources::new(0, 2, 512);
        for _ in 0..20 {
            hints.record_hit(&partition);
        }
        assert!(hints.should_probe(&partition));
    }

    #[test]
    fn lossy_partition_is_mostly_skipped() {
        let hints = PartitionHints::new();
        let partition = Resources::new(1, 4, 4_096);
        for _ in 0..100 {
            hints.record_miss(&partition);
        }

        let probes = (0..200).filter(|_| hints.should_probe(&partition)).count();
        // Only the exploration chance remains; 200 draws at 10% stay well
        // under half.
        assert!(probes < 100, "expected mostly skips, saw {probes} probes");
    }

    #[test]
    fn merge_adds_remote_weight() {
        let hints = PartitionHints::new();
        let partition = Resources::new(0, 1, 256);
        hints.record_hit(&partition);

        hints.merge(&[PartitionHint {
            resources: partition,
            hits: 5,
            misses: 2,
        }]);

        let snapshot = hints.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].hits, 6);
        assert_eq!(snapshot[0].misses, 2);
    }
}
