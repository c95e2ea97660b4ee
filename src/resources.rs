//! # Resource Vectors
//!
//! A [`Resources`] value describes a discrete combination of compute
//! capacity: CPU quality class, CPU core count, and RAM. Partitions of the
//! identifier space, offers, and search requests are all expressed in this
//! vocabulary.
//!
//! The CPU class is categorical (a quality tier), not additive: arithmetic
//! only touches cores and RAM, while comparisons treat a higher class as a
//! superset of a lower one.
//!
//! All bookkeeping mutations go through checked arithmetic. Running below
//! zero or above a node's fixed maximum is a bookkeeping bug, surfaced as
//! [`ResourceError::ContractViolation`] and never silently clamped.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from resource bookkeeping.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResourceError {
    /// Accounting left the `0 <= available <= max` corridor. This is a
    /// programming error in the caller, not an external condition.
    #[error("resource bookkeeping violated: {0}")]
    ContractViolation(String),
}

/// A discrete resource combination.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize, PartialOrd, Ord,
)]
pub struct Resources {
    /// CPU quality tier (0 = lowest). Categorical, compared but never summed.
    pub cpu_class: u8,
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// RAM in megabytes.
    pub ram_mb: u32,
}

impl Resources {
    pub fn new(cpu_class: u8, cpu_cores: u32, ram_mb: u32) -> Self {
        Resources {
            cpu_class,
            cpu_cores,
            ram_mb,
        }
    }

    /// True when this vector satisfies `other` in every dimension.
    pub fn contains(&self, other: &Resources) -> bool {
        self.cpu_class >= other.cpu_class
            && self.cpu_cores >= other.cpu_cores
            && self.ram_mb >= other.ram_mb
    }

    /// True when no usable capacity remains.
    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0 && self.ram_mb == 0
    }

    /// Adds cores and RAM, keeping this vector's class.
    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_class: self.cpu_class,
            cpu_cores: self.cpu_cores.checked_add(other.cpu_cores)?,
            ram_mb: self.ram_mb.checked_add(other.ram_mb)?,
        })
    }

    /// Subtracts cores and RAM, keeping this vector's class. `None` when the
    /// result would go below zero in any dimension.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_class: self.cpu_class,
            cpu_cores: self.cpu_cores.checked_sub(other.cpu_cores)?,
            ram_mb: self.ram_mb.checked_sub(other.ram_mb)?,
        })
    }

    /// Verifies `self <= max` componentwise.
    pub fn ensure_within(&self, max: &Resources) -> Result<(), ResourceError> {
        if max.contains(self) {
            Ok(())
        } else {
            Err(ResourceError::ContractViolation(format!(
                "available {} exceeds maximum {}",
                self, max
            )))
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<class:{} cores:{} ram:{}MB>",
            self.cpu_class, self.cpu_cores, self.ram_mb
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_requires_every_dimension() {
        let big = Resources::new(1, 4, 2_048);
        assert!(big.contains(&Resources::new(0, 4, 2_048)));
        assert!(big.contains(&Resources::new(1, 2, 1_024)));
        assert!(!big.contains(&Resources::new(2, 1, 256)));
        assert!(!big.contains(&Resources::new(1, 8, 256)));
        assert!(!big.contains(&Resources::new(1, 4, 4_096)));
    }

    #[test]
    fn checked_sub_refuses_negative_results() {
        let avail = Resources::new(0, 2, 512);
        assert_eq!(
            avail.checked_sub(&Resources::new(0, 1, 256)),
            Some(Resources::new(0, 1, 256))
        );
        assert_eq!(avail.checked_sub(&Resources::new(0, 4, 0)), None);
        assert_eq!(avail.checked_sub(&Resources::new(0, 0, 1_024)), None);
    }

    #[test]
    fn ensure_within_flags_excess() {
        let max = Resources::new(0, 4, 1_024);
        assert!(Resources::new(0, 4, 1_024).ensure_within(&max).is_ok());
        assert!(Resources::new(0, 5, 512).ensure_within(&max).is_err());
    }
}
