//! Multi-offer strategy: the canonical variant.
//!
//! A supplier running this strategy keeps one offer outstanding for *every*
//! configured partition its free capacity covers, so buyers of any smaller
//! class can find it directly without escalating. Discovery uses the
//! adaptive partition hints to skip probing partitions that have been
//! answering empty.

use async_trait::async_trait;

use crate::messages::{AvailableOffer, NodeRef};
use crate::resources::Resources;

use super::{locate_trader, search_offers, OfferingStrategy, PlacementError, StrategyContext};

pub struct MultipleOfferStrategy;

impl MultipleOfferStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MultipleOfferStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OfferingStrategy for MultipleOfferStrategy {
    fn name(&self) -> &str {
        "multiple-offer"
    }

    fn advertised_partitions(&self, ctx: &StrategyContext, free: &Resources) -> Vec<Resources> {
        ctx.mapping.lower_or_equal_partitions(free)
    }

    async fn place_offer(
        &self,
        ctx: &StrategyContext,
        target: &Resources,
    ) -> Result<NodeRef, PlacementError> {
        locate_trader(ctx, target).await
    }

    async fn find_offers(&self, ctx: &StrategyContext, request: &Resources) -> Vec<AvailableOffer> {
        search_offers(ctx, request, true).await
    }
}
