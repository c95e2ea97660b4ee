//! # Configuration
//!
//! This module defines the configuration structure for a marketplace node.
//! Loading (files, CLI, environment) is the embedder's concern; this crate
//! only consumes the resulting struct.

use std::time::Duration;

use crate::mapping::PartitionSpec;

/// Configuration for one marketplace node instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Transport endpoint other nodes reach this node at, `host:port`
    pub node_ip: String,

    /// Identifier space width in bits (max 128)
    pub guid_bits: u32,

    /// Percentage weights of the resource partition tree
    pub partitions: PartitionSpec,

    /// How often the supplier reconciles what it advertises
    pub supplying_interval: Duration,

    /// How often the supplier checks its offers for missed refreshes
    pub refreshes_check_interval: Duration,

    /// How often a trader pings the suppliers behind its stored offers
    pub refreshing_interval: Duration,

    /// How often a trader re-advertises itself to same-class ring neighbors
    pub spread_offers_interval: Duration,

    /// A supplier-side offer with no refresh for this long counts one miss
    pub refresh_missed_timeout: Duration,

    /// Misses before the supplier presumes the trader dead and evicts
    pub max_refreshes_missed: u32,

    /// Consecutive failed pings before a trader drops an offer
    pub max_refreshes_failed: u32,

    /// Reservations each advertised offer backs
    pub offers_amount: u32,

    /// Offering strategy to drive advertising and discovery with
    pub strategy: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Config {
            node_ip: String::new(),
            guid_bits: 0,
            partitions: PartitionSpec::default(),
            supplying_interval: Duration::ZERO,
            refreshes_check_interval: Duration::ZERO,
            refreshing_interval: Duration::ZERO,
            spread_offers_interval: Duration::ZERO,
            refresh_missed_timeout: Duration::ZERO,
            max_refreshes_missed: 0,
            max_refreshes_failed: 0,
            offers_amount: 0,
            strategy: String::new(),
        };
        config.apply_defaults();
        config
    }
}

impl Config {
    /// Applies sensible defaults for any unset or zero values.
    ///
    /// Should be called after the embedder populates the struct.
    pub fn apply_defaults(&mut self) {
        if self.node_ip.is_empty() {
            self.node_ip = "127.0.0.1:7400".to_string();
        }
        if self.guid_bits == 0 {
            self.guid_bits = 128;
        }
        if self.supplying_interval == Duration::ZERO {
            self.supplying_interval = Duration::from_secs(45);
        }
        if self.refreshes_check_interval == Duration::ZERO {
            self.refreshes_check_interval = Duration::from_secs(30);
        }
        if self.refreshing_interval == Duration::ZERO {
            self.refreshing_interval = Duration::from_secs(15);
        }
        if self.spread_offers_interval == Duration::ZERO {
            self.spread_offers_interval = Duration::from_secs(60);
        }
        if self.refresh_missed_timeout == Duration::ZERO {
            self.refresh_missed_timeout = Duration::from_secs(40);
        }
        if self.max_refreshes_missed == 0 {
            self.max_refreshes_missed = 2;
        }
        if self.max_refreshes_failed == 0 {
            self.max_refreshes_failed = 2;
        }
        if self.offers_amount == 0 {
            self.offers_amount = 1;
        }
        if self.strategy.is_empty() {
            self.strategy = "multiple-offer".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_zero_value() {
        let config = Config::default();
        assert_eq!(config.guid_bits, 128);
        assert_eq!(config.max_refreshes_missed, 2);
        assert_eq!(config.max_refreshes_failed, 2);
        assert!(config.supplying_interval > Duration::ZERO);
        assert!(config.refresh_missed_timeout > Duration::ZERO);
        assert_eq!(config.strategy, "multiple-offer");
    }

    #[test]
    fn explicit_values_survive_apply_defaults() {
        let mut config = Config {
            guid_bits: 16,
            max_refreshes_missed: 5,
            ..Config::default()
        };
        config.apply_defaults();
        assert_eq!(config.guid_bits, 16);
        assert_eq!(config.max_refreshes_missed, 5);
    }
}
