//! # Offering Strategy Framework
//!
//! This module provides the abstraction layer for offer placement and
//! discovery algorithms. It defines the [`OfferingStrategy`] trait and a
//! [`StrategyRegistry`] for managing strategy implementations.
//!
//! # Available Strategies
//!
//! - [`multiple::MultipleOfferStrategy`]: advertises every configured
//!   partition the node's free capacity covers, biased discovery probing
//! - [`single::SingleOfferStrategy`]: advertises one offer at a time, plain
//!   discovery probing
//!
//! # Shared Discovery Engine
//!
//! Both strategies share the same two walks over the partition tree:
//!
//! - **Placement** de-escalates: random probe inside the fitting partition,
//!   then the partition's deterministic lower bound, then progressively
//!   smaller partitions, until a live trader of the right class is found or
//!   the tree is exhausted.
//! - **Search** escalates: a request must be satisfied, so an empty
//!   partition sends the walk toward progressively *larger* capability
//!   classes instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::comm::MarketComm;
use crate::guid::Guid;
use crate::hints::PartitionHints;
use crate::mapping::{FitPolicy, MappingError, ResourceMapping};
use crate::messages::{AvailableOffer, GetOffers, NodeRef};
use crate::overlay::Overlay;
use crate::resources::Resources;

pub mod multiple;
pub mod single;

/// Errors from offer placement.
#[derive(Error, Debug)]
pub enum PlacementError {
    /// No live trader of a suitable class was found anywhere in or below
    /// the fitting partition. Recoverable: the supplier skips this
    /// advertising cycle and retries on the next tick.
    #[error("no nodes available to host the offer")]
    NoNodesAvailable,

    /// The target vector does not map into the partition tree
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Everything a strategy needs to run its walks: the partition tree, the
/// overlay lookup, the protocol client, the local hint store, and this
/// node's own address.
pub struct StrategyContext {
    pub mapping: Arc<ResourceMapping>,
    pub overlay: Arc<dyn Overlay>,
    pub comm: Arc<dyn MarketComm>,
    pub hints: Arc<PartitionHints>,
    pub local: NodeRef,
}

/// Pluggable placement/discovery algorithm.
///
/// Variants differ mainly in how many offers a supplier keeps outstanding
/// at once; the underlying partition walks are shared.
#[async_trait]
pub trait OfferingStrategy: Send + Sync {
    /// Strategy name used for registry lookup (e.g. "multiple-offer").
    fn name(&self) -> &str;

    /// Which partitions a supplier with `free` capacity should currently be
    /// advertising, largest first.
    fn advertised_partitions(&self, ctx: &StrategyContext, free: &Resources) -> Vec<Resources>;

    /// Locates a trader node able to broker an offer of class `target`.
    async fn place_offer(
        &self,
        ctx: &StrategyContext,
        target: &Resources,
    ) -> Result<NodeRef, PlacementError>;

    /// Locates candidate offers satisfying `request`. An empty result is
    /// "not schedulable now", not an error.
    async fn find_offers(&self, ctx: &StrategyContext, request: &Resources) -> Vec<AvailableOffer>;
}

/// Looks up `probe` in the overlay and keeps only nodes that actually serve
/// `partition` — a lookup can land on a partition-boundary node whose own
/// class differs.
async fn live_traders_for(
    ctx: &StrategyContext,
    probe: Guid,
    partition: &Resources,
) -> Vec<NodeRef> {
    let key = match probe.to_bytes(ctx.mapping.bits()) {
        Ok(key) => key,
        Err(err) => {
            warn!(error = %err, "cannot encode lookup key");
            return Vec::new();
        }
    };

    match ctx.overlay.lookup(&key).await {
        Ok(nodes) => nodes
            .into_iter()
            .filter(|node| {
                ctx.mapping
                    .resources_by_guid(node.guid)
                    .map(|handled| handled == *partition)
                    .unwrap_or(false)
            })
            .collect(),
        Err(err) => {
            warn!(probe = %probe, error = %err, "overlay lookup failed");
            Vec::new()
        }
    }
}

/// Shared placement walk: random probe, deterministic anchor, then
/// de-escalation through smaller partitions.
pub(crate) async fn locate_trader(
    ctx: &StrategyContext,
    target: &Resources,
) -> Result<NodeRef, PlacementError> {
    let partition = ctx.mapping.fittest_for_offer(target)?;

    let probe = ctx.mapping.random_guid(FitPolicy::Offer, target)?;
    if let Some(node) = live_traders_for(ctx, probe, &partition).await.into_iter().next() {
        return Ok(node);
    }

    let mut anchor = ctx.mapping.first_guid(FitPolicy::Offer, target)?;
    if let Some(node) = live_traders_for(ctx, anchor, &partition).await.into_iter().next() {
        return Ok(node);
    }

    loop {
        anchor = match ctx.mapping.lower_random_guid(anchor) {
            Ok(id) => id,
            Err(MappingError::NoMoreCombinations) => return Err(PlacementError::NoNodesAvailable),
            Err(err) => return Err(err.into()),
        };
        let partition = ctx.mapping.resources_by_guid(anchor)?;
        debug!(partition = %partition, "placement de-escalating");
        if let Some(node) = live_traders_for(ctx, anchor, &partition).await.into_iter().next() {
            return Ok(node);
        }
    }
}

/// Shared search walk: probe the fitting partition, then escalate through
/// larger ones. Relay to ring neighbors is only allowed on the first probe
/// so a query travels a bounded distance.
///
/// When `gated` is set, partitions beyond the first are skipped while their
/// observed hit ratio is poor (see [`PartitionHints`]); the fitting
/// partition itself is always probed so exact searches keep working.
pub(crate) async fn search_offers(
    ctx: &StrategyContext,
    request: &Resources,
    gated: bool,
) -> Vec<AvailableOffer> {
    let mut partition = match ctx.mapping.fittest_for_search(request) {
        Ok(partition) => partition,
        Err(err) => {
            debug!(request = %request, error = %err, "request exceeds every partition");
            return Vec::new();
        }
    };

    let mut probe = match ctx.mapping.random_guid(FitPolicy::Search, request) {
        Ok(id) => id,
        Err(err) => {
            debug!(request = %request, error = %err, "no identifier for request");
            return Vec::new();
        }
    };
    let mut first = true;

    loop {
        if first || !gated || ctx.hints.should_probe(&partition) {
            let offers = query_partition(ctx, probe, &partition, first).await;
            if !offers.is_empty() {
                ctx.hints.record_hit(&partition);
                return offers;
            }
            ctx.hints.record_miss(&partition);
        }

        probe = match ctx.mapping.higher_random_guid(probe) {
            Ok(id) => id,
            Err(MappingError::NoMoreCombinations) => return Vec::new(),
            Err(err) => {
                warn!(error = %err, "search escalation failed");
                return Vec::new();
            }
        };
        partition = match ctx.mapping.resources_by_guid(probe) {
            Ok(partition) => partition,
            Err(_) => return Vec::new(),
        };
        debug!(partition = %partition, "search escalating");
        first = false;
    }
}

/// Queries one partition's traders for offers: the random probe first, the
/// deterministic anchor as fallback.
async fn query_partition(
    ctx: &StrategyContext,
    probe: Guid,
    partition: &Resources,
    relay: bool,
) -> Vec<AvailableOffer> {
    let mut candidates = live_traders_for(ctx, probe, partition).await;
    if candidates.is_empty() {
        if let Ok(anchor) = ctx.mapping.first_guid(FitPolicy::Search, partition) {
            candidates = live_traders_for(ctx, anchor, partition).await;
        }
    }

    for trader in candidates {
        let request = GetOffers {
            from_node: ctx.local.clone(),
            to_trader: trader.clone(),
            relay,
        };
        match ctx.comm.get_offers(request).await {
            Ok(response) => {
                ctx.hints.merge(&response.hints);
                if !response.offers.is_empty() {
                    return response.offers;
                }
            }
            Err(err) => {
                warn!(trader = %trader, error = %err, "get offers failed");
            }
        }
    }
    Vec::new()
}

/// Registry for managing offering strategies.
///
/// Built explicitly at startup and passed by reference — no global
/// registration side effects. The first registered strategy becomes the
/// default.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn OfferingStrategy>>,
    default_strategy: Option<String>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            default_strategy: None,
        }
    }

    /// Registers a strategy. The first registered strategy becomes the
    /// default.
    pub fn register(&mut self, strategy: Arc<dyn OfferingStrategy>) {
        let name = strategy.name().to_string();
        self.strategies.insert(name.clone(), strategy);

        if self.default_strategy.is_none() {
            self.default_strategy = Some(name);
        }
    }

    /// Gets a strategy by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn OfferingStrategy>> {
        self.strategies.get(name).cloned()
    }

    /// Gets the default strategy.
    pub fn default_strategy(&self) -> Option<Arc<dyn OfferingStrategy>> {
        self.default_strategy
            .as_ref()
            .and_then(|name| self.get(name))
    }

    /// Lists all registered strategy names.
    pub fn list(&self) -> Vec<&str> {
        self.strategies.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates the default registry with both shipped strategies.
pub fn create_default_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(multiple::MultipleOfferStrategy::new()));
    registry.register(Arc::new(single::SingleOfferStrategy::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_strategy_is_default() {
        let registry = create_default_registry();
        assert_eq!(
            registry.default_strategy().unwrap().name(),
            "multiple-offer"
        );
        assert!(registry.get("single-offer").is_some());
        assert!(registry.get("unknown").is_none());

        let mut names = registry.list();
        names.sort_unstable();
        assert_eq!(names, vec!["multiple-offer", "single-offer"]);
    }
}
