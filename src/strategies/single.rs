//! Single-offer strategy.
//!
//! A supplier running this strategy advertises exactly one offer at a time:
//! the largest configured partition its free capacity covers. Cheaper to
//! maintain (one refresh relationship per node) at the cost of making small
//! requests escalate to find it. Discovery probes every partition; with so
//! few offers in the ring, hint gating would starve the search.

use async_trait::async_trait;

use crate::messages::{AvailableOffer, NodeRef};
use crate::resources::Resources;

use super::{locate_trader, search_offers, OfferingStrategy, PlacementError, StrategyContext};

pub struct SingleOfferStrategy;

impl SingleOfferStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SingleOfferStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OfferingStrategy for SingleOfferStrategy {
    fn name(&self) -> &str {
        "single-offer"
    }

    fn advertised_partitions(&self, ctx: &StrategyContext, free: &Resources) -> Vec<Resources> {
        ctx.mapping
            .fittest_for_offer(free)
            .map(|partition| vec![partition])
            .unwrap_or_default()
    }

    async fn place_offer(
        &self,
        ctx: &StrategyContext,
        target: &Resources,
    ) -> Result<NodeRef, PlacementError> {
        locate_trader(ctx, target).await
    }

    async fn find_offers(&self, ctx: &StrategyContext, request: &Resources) -> Vec<AvailableOffer> {
        search_offers(ctx, request, false).await
    }
}
