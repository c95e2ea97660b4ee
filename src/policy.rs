//! # Scheduling Policy
//!
//! Ranking of already-discovered offers. Discovery returns candidates; a
//! [`SchedulingPolicy`] decides which one a buyer tries to reserve first.
//! The marketplace only consumes the contract — embedders plug in their own
//! ranking if the shipped weighted fit does not suit them.

use crate::messages::AvailableOffer;
use crate::resources::Resources;

/// Orders candidate offers in place, best first.
///
/// Implementations must be deterministic for identical input so two
/// identical searches reserve in the same order.
pub trait SchedulingPolicy: Send + Sync {
    fn rank(&self, request: &Resources, offers: &mut Vec<AvailableOffer>);
}

/// Weighted closeness-of-fit ranking.
///
/// An offer scores highest when it matches the request tightly in the
/// weighted dimensions; oversized offers rank lower so big partitions are
/// left for big requests. Ties break on supplier address, then offer id,
/// keeping the order deterministic.
#[derive(Clone, Debug)]
pub struct WeightedPolicy {
    pub cpu_weight: f64,
    pub ram_weight: f64,
}

impl Default for WeightedPolicy {
    fn default() -> Self {
        WeightedPolicy {
            cpu_weight: 0.5,
            ram_weight: 0.5,
        }
    }
}

impl WeightedPolicy {
    fn score(&self, request: &Resources, offer: &AvailableOffer) -> f64 {
        let cpu_fit = ratio(request.cpu_cores, offer.resources.cpu_cores);
        let ram_fit = ratio(request.ram_mb, offer.resources.ram_mb);
        self.cpu_weight * cpu_fit + self.ram_weight * ram_fit
    }
}

/// `request / offered`, clamped to 1.0. An exact fit scores 1.0, an
/// oversized offer trends toward 0.
fn ratio(requested: u32, offered: u32) -> f64 {
    if offered == 0 {
        return 0.0;
    }
    (requested as f64 / offered as f64).min(1.0)
}

impl SchedulingPolicy for WeightedPolicy {
    fn rank(&self, request: &Resources, offers: &mut Vec<AvailableOffer>) {
        offers.sort_by(|a, b| {
            self.score(request, b)
                .partial_cmp(&self.score(request, a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.supplier_ip.cmp(&b.supplier_ip))
                .then_with(|| a.offer_id.cmp(&b.offer_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;
    use crate::messages::OfferId;

    fn offer(ip: &str, id: u64, resources: Resources) -> AvailableOffer {
        AvailableOffer {
            supplier_ip: ip.to_string(),
            supplier_guid: Guid::new(1),
            offer_id: OfferId(id),
            amount: 1,
            resources,
        }
    }

    #[test]
    fn tighter_fit_ranks_first() {
        let policy = WeightedPolicy::default();
        let request = Resources::new(0, 2, 512);
        let mut offers = vec![
            offer("10.0.0.1:7400", 1, Resources::new(0, 8, 4_096)),
            offer("10.0.0.2:7400", 1, Resources::new(0, 2, 512)),
        ];

        policy.rank(&request, &mut offers);
        assert_eq!(offers[0].supplier_ip, "10.0.0.2:7400");
    }

    #[test]
    fn equal_scores_break_ties_deterministically() {
        let policy = WeightedPolicy::default();
        let request = Resources::new(0, 1, 256);
        let resources = Resources::new(0, 2, 512);
        let mut offers = vec![
            offer("10.0.0.9:7400", 3, resources),
            offer("10.0.0.1:7400", 2, resources),
            offer("10.0.0.1:7400", 1, resources),
        ];

        policy.rank(&request, &mut offers);
        assert_eq!(offers[0].supplier_ip, "10.0.0.1:7400");
        assert_eq!(offers[0].offer_id, OfferId(1));
        assert_eq!(offers[1].offer_id, OfferId(2));
        assert_eq!(offers[2].supplier_ip, "10.0.0.9:7400");
    }
}
