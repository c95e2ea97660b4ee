//! # Market Node
//!
//! This module provides the per-node orchestration: one [`MarketNode`] wires
//! the partition mapping, the offering strategy, the supplier, and one
//! trader per owned virtual overlay node, and routes the remote protocol to
//! the right instance.
//!
//! # Lifecycle
//!
//! ```text
//! MarketNode::new() ──▶ build mapping ──▶ pick strategy ──▶ Supplier::new()
//!      │
//!      ▼
//! create_market() / join_market() ──▶ overlay callback ──▶ Trader per
//!      │                                                   virtual node
//!      ▼
//! find_resources() / obtain_resources() / return_resources()
//! ```
//!
//! The embedding transport calls the `handle_*` methods with decoded
//! protocol messages; everything else stays internal to the instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::comm::MarketComm;
use crate::config::Config;
use crate::guid::Guid;
use crate::hints::PartitionHints;
use crate::mapping::{MappingError, ResourceMapping};
use crate::messages::{
    AdvertiseOffersNeighbor, AvailableOffer, CreateOffer, GetOffers, GetOffersResponse, NodeRef,
    OfferAck, OfferId, RefreshOffer, RefreshOfferResponse, RemoveOffer, UpdateOffer,
};
use crate::overlay::{Membership, Overlay};
use crate::policy::{SchedulingPolicy, WeightedPolicy};
use crate::resources::{ResourceError, Resources};
use crate::strategies::{create_default_registry, OfferingStrategy, StrategyContext};
use crate::supplier::Supplier;
use crate::trader::Trader;

/// Errors from node construction.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("unknown offering strategy: {0}")]
    UnknownStrategy(String),
}

struct NodeShared {
    config: Config,
    mapping: Arc<ResourceMapping>,
    ctx: Arc<StrategyContext>,
    strategy: Arc<dyn OfferingStrategy>,
    policy: Mutex<Arc<dyn SchedulingPolicy>>,
    supplier: Supplier,
    traders: Mutex<HashMap<Guid, Trader>>,
    overlay: Arc<dyn Overlay>,
    comm: Arc<dyn MarketComm>,
}

/// One marketplace participant. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MarketNode {
    shared: Arc<NodeShared>,
}

impl std::fmt::Debug for MarketNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketNode").finish_non_exhaustive()
    }
}

impl MarketNode {
    /// Builds a node owning `max_resources` capacity, addressed in the
    /// overlay by `node_guid`.
    ///
    /// The offering strategy is picked from the default registry by
    /// `config.strategy`; ranking defaults to [`WeightedPolicy`] and can be
    /// swapped with [`set_scheduling_policy`](Self::set_scheduling_policy).
    pub fn new(
        mut config: Config,
        max_resources: Resources,
        node_guid: Guid,
        overlay: Arc<dyn Overlay>,
        comm: Arc<dyn MarketComm>,
    ) -> Result<Self, NodeError> {
        config.apply_defaults();

        let mapping = Arc::new(ResourceMapping::new(config.guid_bits, &config.partitions)?);
        let strategy = create_default_registry()
            .get(&config.strategy)
            .ok_or_else(|| NodeError::UnknownStrategy(config.strategy.clone()))?;

        let ctx = Arc::new(StrategyContext {
            mapping: mapping.clone(),
            overlay: overlay.clone(),
            comm: comm.clone(),
            hints: Arc::new(PartitionHints::new()),
            local: NodeRef::new(config.node_ip.clone(), node_guid),
        });

        let supplier = Supplier::new(config.clone(), max_resources, ctx.clone(), strategy.clone());

        Ok(MarketNode {
            shared: Arc::new(NodeShared {
                config,
                mapping,
                ctx,
                strategy,
                policy: Mutex::new(Arc::new(WeightedPolicy::default())),
                supplier,
                traders: Mutex::new(HashMap::new()),
                overlay,
                comm,
            }),
        })
    }

    /// Bootstraps a fresh marketplace with this node as the first member.
    pub async fn create_market(&self) -> Result<()> {
        self.shared.overlay.create(self.membership()).await?;
        self.shared.supplier.start();
        info!("marketplace created");
        Ok(())
    }

    /// Joins an existing marketplace through a seed node.
    pub async fn join_market(&self, seed_ip: &str, seed_port: u16) -> Result<()> {
        self.shared
            .overlay
            .join(seed_ip, seed_port, self.membership())
            .await?;
        self.shared.supplier.start();
        info!(seed = %seed_ip, "marketplace joined");
        Ok(())
    }

    /// Leaves the marketplace: stops every instance, then releases the
    /// overlay membership.
    pub async fn leave_market(&self) -> Result<()> {
        self.shared.supplier.stop().await;

        let traders: Vec<Trader> = {
            let mut guard = self.shared.traders.lock().expect("traders lock");
            guard.drain().map(|(_, t)| t).collect()
        };
        for trader in traders {
            trader.stop().await;
        }

        self.shared.overlay.leave().await?;
        info!("marketplace left");
        Ok(())
    }

    /// Buyer-side search: discovers candidate offers for `request` and
    /// returns them ranked, best first. Empty means "not schedulable now".
    pub async fn find_resources(&self, request: &Resources) -> Vec<AvailableOffer> {
        let mut offers = self
            .shared
            .strategy
            .find_offers(&self.shared.ctx, request)
            .await;
        let policy = self.shared.policy.lock().expect("policy lock").clone();
        policy.rank(request, &mut offers);
        offers
    }

    /// Reserves `requested` out of one of this node's own offers. See
    /// [`Supplier::obtain_resources`] for the result contract.
    pub fn obtain_resources(
        &self,
        offer_id: OfferId,
        requested: &Resources,
    ) -> Result<bool, ResourceError> {
        self.shared.supplier.obtain_resources(offer_id, requested)
    }

    /// Returns previously reserved capacity to this node's free pool.
    pub fn return_resources(&self, vector: &Resources) -> Result<(), ResourceError> {
        self.shared.supplier.return_resources(vector)
    }

    /// Replaces the offer-ranking policy.
    pub fn set_scheduling_policy(&self, policy: Arc<dyn SchedulingPolicy>) {
        *self.shared.policy.lock().expect("policy lock") = policy;
    }

    // ------------------------------------------------------------------
    // Inbound protocol routing (called by the embedding transport)
    // ------------------------------------------------------------------

    pub fn handle_create_offer(&self, msg: CreateOffer) -> OfferAck {
        match self.trader_by_guid(msg.to_trader.guid) {
            Some(trader) => OfferAck {
                accepted: trader.handle_create_offer(&msg.from_supplier, &msg.offer),
            },
            None => {
                warn!(to = %msg.to_trader, "create offer for a trader this node does not own");
                OfferAck { accepted: false }
            }
        }
    }

    pub fn handle_refresh_offer(&self, msg: RefreshOffer) -> RefreshOfferResponse {
        RefreshOfferResponse {
            refreshed: self
                .shared
                .supplier
                .refresh_offer(msg.offer_id, msg.from_trader),
        }
    }

    pub fn handle_remove_offer(&self, msg: RemoveOffer) -> OfferAck {
        match self.trader_by_guid(msg.to_trader.guid) {
            Some(trader) => {
                trader.handle_remove_offer(&msg.from_supplier, msg.offer_id);
                OfferAck { accepted: true }
            }
            None => OfferAck { accepted: false },
        }
    }

    pub fn handle_update_offer(&self, msg: UpdateOffer) -> OfferAck {
        match self.trader_by_guid(msg.to_trader.guid) {
            Some(trader) => OfferAck {
                accepted: trader.handle_update_offer(&msg.from_supplier, &msg.offer),
            },
            None => OfferAck { accepted: false },
        }
    }

    pub async fn handle_get_offers(&self, msg: GetOffers) -> GetOffersResponse {
        let offers = match self.trader_by_guid(msg.to_trader.guid) {
            Some(trader) => trader.handle_get_offers(&msg.from_node, msg.relay).await,
            None => Vec::new(),
        };
        GetOffersResponse {
            offers,
            hints: self.shared.ctx.hints.snapshot(),
        }
    }

    pub async fn handle_advertise_offers_neighbor(&self, msg: AdvertiseOffersNeighbor) -> OfferAck {
        match self.trader_by_guid(msg.to_neighbor.guid) {
            Some(trader) => {
                trader
                    .handle_advertise_neighbor(&msg.from_trader, &msg.offering)
                    .await;
                OfferAck { accepted: true }
            }
            None => OfferAck { accepted: false },
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn supplier(&self) -> &Supplier {
        &self.shared.supplier
    }

    pub fn trader_by_guid(&self, guid: Guid) -> Option<Trader> {
        self.shared
            .traders
            .lock()
            .expect("traders lock")
            .get(&guid)
            .cloned()
    }

    pub fn traders(&self) -> Vec<Trader> {
        self.shared
            .traders
            .lock()
            .expect("traders lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn mapping(&self) -> &ResourceMapping {
        &self.shared.mapping
    }

    // ------------------------------------------------------------------
    // Overlay membership
    // ------------------------------------------------------------------

    fn membership(&self) -> Arc<dyn Membership> {
        Arc::new(MembershipBridge { node: self.clone() })
    }

    fn add_virtual_node(&self, guid: Guid) {
        let local = NodeRef::new(self.shared.config.node_ip.clone(), guid);
        let trader = match Trader::new(
            self.shared.config.clone(),
            local,
            self.shared.mapping.clone(),
            self.shared.comm.clone(),
            self.shared.overlay.clone(),
        ) {
            Ok(trader) => trader,
            Err(err) => {
                warn!(guid = %guid, error = %err, "virtual node outside the partitioned space");
                return;
            }
        };

        info!(guid = %guid, class = %trader.handled_resources(), "trader started");
        trader.start();
        self.shared
            .traders
            .lock()
            .expect("traders lock")
            .insert(guid, trader);
    }

    fn remove_virtual_node(&self, guid: Guid) {
        let trader = self
            .shared
            .traders
            .lock()
            .expect("traders lock")
            .remove(&guid);
        if let Some(trader) = trader {
            info!(guid = %guid, "trader retiring");
            tokio::spawn(async move {
                trader.stop().await;
            });
        }
    }
}

/// Adapts overlay membership callbacks onto trader lifecycle.
struct MembershipBridge {
    node: MarketNode,
}

impl Membership for MembershipBridge {
    fn virtual_node_added(&self, guid: Guid) {
        self.node.add_virtual_node(guid);
    }

    fn virtual_node_removed(&self, guid: Guid) {
        self.node.remove_virtual_node(guid);
    }
}
