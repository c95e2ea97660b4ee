//! # Resource Mapping
//!
//! Static, hierarchical partitioning of the identifier space into resource
//! classes. One level per resource dimension (CPU class, then cores, then
//! RAM), each level sliced by percentage weights, each leaf bound to exactly
//! one [`GuidRange`] and one concrete [`Resources`] combination.
//!
//! The tree is built once from a declarative [`PartitionSpec`] and is
//! immutable afterward. Construction verifies that the leaf ranges tile the
//! whole space contiguously and that capability ascends with the ranges, so
//! "next higher / next lower partition" reduces to a walk over the ordered
//! leaf list.
//!
//! Two fitting policies with opposite tie-breaks share the tree:
//!
//! - **Search** rounds a requested vector *up* to the smallest configured
//!   partition that satisfies it (an offer must cover the request).
//! - **Offer** rounds an available vector *down* to the largest configured
//!   partition it can cover (a supplier must not overclaim).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::guid::{Guid, GuidRange};
use crate::resources::Resources;

/// Errors from partition-tree construction and lookups.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MappingError {
    /// The partition specification cannot produce a valid tree
    #[error("invalid partition specification: {0}")]
    InvalidSpec(String),

    /// No configured partition fits the given vector under the policy
    #[error("no configured partition fits {0}")]
    NoFittingPartition(Resources),

    /// A higher/lower traversal ran off the end of the tree. Callers treat
    /// this as "no wider/narrower offer class exists", not as a failure.
    #[error("no more resource combinations in this direction")]
    NoMoreCombinations,

    /// The identifier falls outside every configured partition
    #[error("identifier {0} is outside the partitioned space")]
    UnmappedGuid(Guid),
}

/// Fitting policy: which side a vector is rounded to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FitPolicy {
    /// Ceil-to-grid: smallest partition satisfying the vector (buyer side).
    Search,
    /// Floor-to-grid: largest partition the vector can cover (supplier side).
    Offer,
}

/// RAM tier leaf of the partition specification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RamSpec {
    pub ram_mb: u32,
    pub percentage: u8,
}

/// Core-count level of the partition specification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuCoresSpec {
    pub cores: u32,
    pub percentage: u8,
    pub ram: Vec<RamSpec>,
}

/// CPU-class level of the partition specification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuClassSpec {
    pub cpu_class: u8,
    pub percentage: u8,
    pub cpu_cores: Vec<CpuCoresSpec>,
}

/// Declarative description of the whole partition tree.
///
/// Weights are percentages of the parent range and need not sum to 100; the
/// last sibling at each level absorbs whatever is left. Entries must ascend
/// in capability within each level.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionSpec {
    pub cpu_classes: Vec<CpuClassSpec>,
}

impl Default for PartitionSpec {
    /// Two quality tiers covering small-to-midsize edge boxes.
    fn default() -> Self {
        PartitionSpec {
            cpu_classes: vec![
                CpuClassSpec {
                    cpu_class: 0,
                    percentage: 50,
                    cpu_cores: vec![
                        CpuCoresSpec {
                            cores: 1,
                            percentage: 50,
                            ram: vec![
                                RamSpec {
                                    ram_mb: 256,
                                    percentage: 50,
                                },
                                RamSpec {
                                    ram_mb: 512,
                                    percentage: 50,
                                },
                            ],
                        },
                        CpuCoresSpec {
                            cores: 2,
                            percentage: 50,
                            ram: vec![
                                RamSpec {
                                    ram_mb: 512,
                                    percentage: 50,
                                },
                                RamSpec {
                                    ram_mb: 1_024,
                                    percentage: 50,
                                },
                            ],
                        },
                    ],
                },
                CpuClassSpec {
                    cpu_class: 1,
                    percentage: 50,
                    cpu_cores: vec![
                        CpuCoresSpec {
                            cores: 2,
                            percentage: 50,
                            ram: vec![
                                RamSpec {
                                    ram_mb: 1_024,
                                    percentage: 50,
                                },
                                RamSpec {
                                    ram_mb: 2_048,
                                    percentage: 50,
                                },
                            ],
                        },
                        CpuCoresSpec {
                            cores: 4,
                            percentage: 50,
                            ram: vec![
                                RamSpec {
                                    ram_mb: 2_048,
                                    percentage: 50,
                                },
                                RamSpec {
                                    ram_mb: 4_096,
                                    percentage: 50,
                                },
                            ],
                        },
                    ],
                },
            ],
        }
    }
}

/// One leaf of the partition tree: a resource combination and the slice of
/// identifier space that addresses it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub resources: Resources,
    pub range: GuidRange,
}

/// The built, immutable partition tree.
///
/// Leaves are held flattened in ascending capability order, which by
/// construction is also ascending range order.
#[derive(Clone, Debug)]
pub struct ResourceMapping {
    bits: u32,
    partitions: Vec<Partition>,
}

impl ResourceMapping {
    /// Builds the tree for an identifier space of `bits` width.
    pub fn new(bits: u32, spec: &PartitionSpec) -> Result<Self, MappingError> {
        if spec.cpu_classes.is_empty() {
            return Err(MappingError::InvalidSpec("no CPU classes".into()));
        }

        let space_max =
            Guid::space_max(bits).map_err(|e| MappingError::InvalidSpec(e.to_string()))?;
        let full = GuidRange::new(Guid::ZERO, space_max);

        let class_weights: Vec<u8> = spec.cpu_classes.iter().map(|c| c.percentage).collect();
        let class_ranges = full.split_by_percentages(&class_weights);

        let mut leaves = Vec::new();
        for (class, class_range) in spec.cpu_classes.iter().zip(class_ranges) {
            if class.cpu_cores.is_empty() {
                return Err(MappingError::InvalidSpec(format!(
                    "CPU class {} has no core tiers",
                    class.cpu_class
                )));
            }
            let core_weights: Vec<u8> = class.cpu_cores.iter().map(|c| c.percentage).collect();
            for (cores, cores_range) in class
                .cpu_cores
                .iter()
                .zip(class_range.split_by_percentages(&core_weights))
            {
                if cores.ram.is_empty() {
                    return Err(MappingError::InvalidSpec(format!(
                        "core tier {} has no RAM tiers",
                        cores.cores
                    )));
                }
                let ram_weights: Vec<u8> = cores.ram.iter().map(|r| r.percentage).collect();
                for (ram, ram_range) in cores
                    .ram
                    .iter()
                    .zip(cores_range.split_by_percentages(&ram_weights))
                {
                    leaves.push(Partition {
                        resources: Resources::new(class.cpu_class, cores.cores, ram.ram_mb),
                        range: ram_range,
                    });
                }
            }
        }

        Self::verify_tiling(&leaves, &full)?;

        // Zero-weight tiers degenerate to empty ranges; they own no
        // identifier real estate, so no trader can ever serve them.
        let partitions: Vec<Partition> = leaves.into_iter().filter(|p| !p.range.is_empty()).collect();
        if partitions.is_empty() {
            return Err(MappingError::InvalidSpec(
                "every configured partition has zero weight".into(),
            ));
        }
        Self::verify_capability_order(&partitions)?;

        debug!(bits, partitions = partitions.len(), "partition tree built");
        Ok(ResourceMapping { bits, partitions })
    }

    /// Identifier space width in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Ordered non-empty leaves, ascending in capability and range.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Smallest configured partition satisfying `vector` in every dimension.
    pub fn fittest_for_search(&self, vector: &Resources) -> Result<Resources, MappingError> {
        self.fit(FitPolicy::Search, vector).map(|p| p.resources)
    }

    /// Largest configured partition covered by `vector` in every dimension.
    pub fn fittest_for_offer(&self, vector: &Resources) -> Result<Resources, MappingError> {
        self.fit(FitPolicy::Offer, vector).map(|p| p.resources)
    }

    /// Uniformly random identifier inside the fitting partition's range.
    pub fn random_guid(&self, policy: FitPolicy, vector: &Resources) -> Result<Guid, MappingError> {
        let fit = self.fit(policy, vector)?;
        // Non-empty by construction, so the draw cannot fail.
        fit.range
            .random()
            .ok_or(MappingError::NoFittingPartition(*vector))
    }

    /// Deterministic lower bound of the fitting partition's range. Fallback
    /// anchor when a random probe lands on no live node.
    pub fn first_guid(&self, policy: FitPolicy, vector: &Resources) -> Result<Guid, MappingError> {
        Ok(self.fit(policy, vector)?.range.lo())
    }

    /// Inverse lookup: which resource combination owns this identifier.
    pub fn resources_by_guid(&self, id: Guid) -> Result<Resources, MappingError> {
        self.partition_index(id)
            .map(|i| self.partitions[i].resources)
            .ok_or(MappingError::UnmappedGuid(id))
    }

    /// Random identifier in the partition strictly above the one containing
    /// `from`, in fixed traversal order.
    pub fn higher_random_guid(&self, from: Guid) -> Result<Guid, MappingError> {
        let idx = self
            .partition_index(from)
            .ok_or(MappingError::UnmappedGuid(from))?;
        let next = self
            .partitions
            .get(idx + 1)
            .ok_or(MappingError::NoMoreCombinations)?;
        next.range.random().ok_or(MappingError::NoMoreCombinations)
    }

    /// Random identifier in the partition strictly below the one containing
    /// `from`, in fixed traversal order.
    pub fn lower_random_guid(&self, from: Guid) -> Result<Guid, MappingError> {
        let idx = self
            .partition_index(from)
            .ok_or(MappingError::UnmappedGuid(from))?;
        if idx == 0 {
            return Err(MappingError::NoMoreCombinations);
        }
        self.partitions[idx - 1]
            .range
            .random()
            .ok_or(MappingError::NoMoreCombinations)
    }

    /// Every configured combination covered by `vector`, largest first.
    ///
    /// Drives suppliers that advertise several concurrent offers of
    /// decreasing size.
    pub fn lower_or_equal_partitions(&self, vector: &Resources) -> Vec<Resources> {
        self.partitions
            .iter()
            .rev()
            .filter(|p| vector.contains(&p.resources))
            .map(|p| p.resources)
            .collect()
    }

    fn fit(&self, policy: FitPolicy, vector: &Resources) -> Result<&Partition, MappingError> {
        let fitting = match policy {
            FitPolicy::Search => self.partitions.iter().find(|p| p.resources.contains(vector)),
            FitPolicy::Offer => self
                .partitions
                .iter()
                .rev()
                .find(|p| vector.contains(&p.resources)),
        };
        fitting.ok_or(MappingError::NoFittingPartition(*vector))
    }

    fn partition_index(&self, id: Guid) -> Option<usize> {
        self.partitions.iter().position(|p| p.range.contains(id))
    }

    fn verify_tiling(leaves: &[Partition], full: &GuidRange) -> Result<(), MappingError> {
        let mut cursor = full.lo();
        for leaf in leaves {
            if leaf.range.lo() != cursor {
                return Err(MappingError::InvalidSpec(format!(
                    "gap or overlap before partition {}",
                    leaf.resources
                )));
            }
            cursor = leaf.range.hi();
        }
        if cursor != full.hi() {
            return Err(MappingError::InvalidSpec(
                "partitions do not cover the identifier space".into(),
            ));
        }
        Ok(())
    }

    fn verify_capability_order(partitions: &[Partition]) -> Result<(), MappingError> {
        for pair in partitions.windows(2) {
            if pair[0].resources >= pair[1].resources {
                return Err(MappingError::InvalidSpec(format!(
                    "capability does not ascend between {} and {}",
                    pair[0].resources, pair[1].resources
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16-bit space, two CPU-core tiers, one RAM tier each.
    fn two_tier_spec() -> PartitionSpec {
        PartitionSpec {
            cpu_classes: vec![CpuClassSpec {
                cpu_class: 0,
                percentage: 100,
                cpu_cores: vec![
                    CpuCoresSpec {
                        cores: 1,
                        percentage: 50,
                        ram: vec![RamSpec {
                            ram_mb: 256,
                            percentage: 100,
                        }],
                    },
                    CpuCoresSpec {
                        cores: 2,
                        percentage: 50,
                        ram: vec![RamSpec {
                            ram_mb: 2_048,
                            percentage: 100,
                        }],
                    },
                ],
            }],
        }
    }

    #[test]
    fn two_tier_ranges_match_expected_bounds() {
        let mapping = ResourceMapping::new(16, &two_tier_spec()).unwrap();
        let parts = mapping.partitions();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].range.lo(), Guid::new(0));
        assert_eq!(parts[0].range.hi(), Guid::new(32_767));
        assert_eq!(parts[1].range.lo(), Guid::new(32_767));
        assert_eq!(parts[1].range.hi(), Guid::new(65_535));
    }

    #[test]
    fn offer_fit_rounds_down_search_fit_rounds_up() {
        let mapping = ResourceMapping::new(16, &two_tier_spec()).unwrap();

        assert_eq!(
            mapping
                .fittest_for_offer(&Resources::new(0, 1, 300))
                .unwrap(),
            Resources::new(0, 1, 256)
        );
        assert_eq!(
            mapping
                .fittest_for_search(&Resources::new(0, 1, 300))
                .unwrap(),
            Resources::new(0, 2, 2_048)
        );
    }

    #[test]
    fn offer_guid_lands_in_fitting_range() {
        let mapping = ResourceMapping::new(16, &two_tier_spec()).unwrap();
        let small = Resources::new(0, 1, 256);

        for _ in 0..100 {
            let id = mapping.random_guid(FitPolicy::Offer, &small).unwrap();
            assert!(id < Guid::new(32_767));
            assert_eq!(mapping.resources_by_guid(id).unwrap(), small);
        }
    }

    #[test]
    fn unordered_spec_is_rejected() {
        let mut spec = two_tier_spec();
        spec.cpu_classes[0].cpu_cores.swap(0, 1);
        assert!(matches!(
            ResourceMapping::new(16, &spec),
            Err(MappingError::InvalidSpec(_))
        ));
    }
}
