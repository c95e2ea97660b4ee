//! # Trader
//!
//! One trader runs per virtual overlay node a physical node owns. A trader
//! is scoped to a single resource class - the class its own identifier maps
//! to - and brokers offers for that class: it stores offers placed by
//! suppliers, verifies supplier liveness, answers discovery queries, and
//! gossips "this trader has offers" pointers along the ring.
//!
//! # Neighbor Cache
//!
//! A trader keeps soft pointers to its immediate ring predecessor and
//! successor *when they are known to handle the same resource class*. The
//! cache is advisory: it is only used to relay discovery queries, can go
//! stale at any time, and is dropped the moment a neighbor answers empty.
//!
//! # Advertisement Relay
//!
//! Advertisements travel outward, away from the offering trader, and stop
//! at the first trader that has offers of its own - a trader with offers
//! answers queries directly, so pushing the pointer past it only multiplies
//! gossip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::comm::MarketComm;
use crate::config::Config;
use crate::guid::Guid;
use crate::mapping::{MappingError, ResourceMapping};
use crate::messages::{
    AdvertiseOffersNeighbor, AvailableOffer, GetOffers, NodeRef, OfferId, OfferSpec, RefreshOffer,
};
use crate::overlay::Overlay;
use crate::resources::Resources;

/// An offer as stored by a trader.
#[derive(Clone, Debug)]
pub struct StoredOffer {
    /// The supplier backing the offer
    pub supplier: NodeRef,
    /// Reservations the offer backs
    pub amount: u32,
    /// Capacity of each reservation
    pub resources: Resources,
    /// When the supplier last confirmed the offer
    pub last_refreshed: Instant,
    /// A ping is in flight; skip this offer until it resolves
    pub waiting_for_refresh: bool,
    /// Consecutive pings that failed at the transport level
    pub refreshes_failed: u32,
}

/// Offers are keyed by the supplier endpoint plus the supplier-local id.
type OfferKey = (String, OfferId);

struct TraderState {
    offers: HashMap<OfferKey, StoredOffer>,
    predecessor: Option<NodeRef>,
    successor: Option<NodeRef>,
    ever_held_offer: bool,
}

struct ServiceHandle {
    stop_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

struct TraderShared {
    config: Config,
    local: NodeRef,
    handled: Resources,
    mapping: Arc<ResourceMapping>,
    comm: Arc<dyn MarketComm>,
    overlay: Arc<dyn Overlay>,
    state: Mutex<TraderState>,
    service: Mutex<Option<ServiceHandle>>,
}

/// A resource-class-scoped offer broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Trader {
    shared: Arc<TraderShared>,
}

/// Outcome of one refresh ping, applied back under the state lock.
enum RefreshOutcome {
    /// Supplier confirmed the offer
    Confirmed,
    /// Supplier explicitly disowned the offer
    Disowned,
    /// Transport failure; counts toward eviction
    Unreachable,
}

impl Trader {
    /// Creates a trader for the virtual node `local`. The handled resource
    /// class is derived once from the trader's own identifier and never
    /// changes.
    pub fn new(
        config: Config,
        local: NodeRef,
        mapping: Arc<ResourceMapping>,
        comm: Arc<dyn MarketComm>,
        overlay: Arc<dyn Overlay>,
    ) -> Result<Self, MappingError> {
        let handled = mapping.resources_by_guid(local.guid)?;
        Ok(Trader {
            shared: Arc::new(TraderShared {
                config,
                local,
                handled,
                mapping,
                comm,
                overlay,
                state: Mutex::new(TraderState {
                    offers: HashMap::new(),
                    predecessor: None,
                    successor: None,
                    ever_held_offer: false,
                }),
                service: Mutex::new(None),
            }),
        })
    }

    /// The resource class this trader brokers.
    pub fn handled_resources(&self) -> Resources {
        self.shared.handled
    }

    /// This trader's own overlay address.
    pub fn local_node(&self) -> NodeRef {
        self.shared.local.clone()
    }

    /// Starts the refresh and spread loops.
    ///
    /// Idempotent - calling multiple times has no effect.
    pub fn start(&self) {
        let mut guard = self.shared.service.lock().expect("trader service lock");
        if guard.is_some() {
            return; // Already running
        }

        let (tx, mut rx) = watch::channel(false);
        let trader = self.clone();

        let join_handle = tokio::spawn(async move {
            let cfg = &trader.shared.config;
            let tick = cfg.refreshing_interval.min(cfg.spread_offers_interval);
            let mut ticker = interval(tick);
            ticker.tick().await; // Immediate first tick

            trader.tick_refresh();
            let mut last_refresh = Instant::now();
            let mut last_spread = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        if now.duration_since(last_refresh) >= cfg.refreshing_interval {
                            trader.tick_refresh();
                            last_refresh = now;
                        }
                        if now.duration_since(last_spread) >= cfg.spread_offers_interval {
                            trader.tick_spread().await;
                            last_spread = now;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(trader = %trader.shared.local, "trader stopped");
        });

        *guard = Some(ServiceHandle {
            stop_tx: tx,
            join_handle,
        });
    }

    /// Stops the background loops gracefully.
    pub async fn stop(&self) {
        let handle = self.shared.service.lock().expect("trader service lock").take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let _ = handle.join_handle.await;
        }
    }

    /// Stores an offer placed by a supplier.
    ///
    /// Only offers at least as large as the handled class are kept - a
    /// buyer routed to this trader expects the handled class or better.
    /// Smaller offers are declined without error. Returns whether the offer
    /// was stored.
    pub fn handle_create_offer(&self, from_supplier: &NodeRef, offer: &OfferSpec) -> bool {
        if !offer.resources.contains(&self.shared.handled) {
            debug!(
                offer = %offer.id,
                offered = %offer.resources,
                handled = %self.shared.handled,
                "declining undersized offer"
            );
            return false;
        }

        let first_ever = {
            let mut state = self.shared.state.lock().expect("trader state lock");
            state.offers.insert(
                (from_supplier.ip.clone(), offer.id),
                StoredOffer {
                    supplier: from_supplier.clone(),
                    amount: offer.amount,
                    resources: offer.resources,
                    last_refreshed: Instant::now(),
                    waiting_for_refresh: false,
                    refreshes_failed: 0,
                },
            );
            let first = !state.ever_held_offer;
            state.ever_held_offer = true;
            first
        };

        info!(offer = %offer.id, supplier = %from_supplier, "offer stored");

        // On the very first offer this trader proactively tells its ring
        // neighbors where offers can be found.
        if first_ever {
            let trader = self.clone();
            tokio::spawn(async move {
                trader.advertise_to_neighbors().await;
            });
        }
        true
    }

    /// Removes an offer. Duplicate or unknown removals are no-ops.
    pub fn handle_remove_offer(&self, from_supplier: &NodeRef, offer_id: OfferId) {
        let mut state = self.shared.state.lock().expect("trader state lock");
        if state
            .offers
            .remove(&(from_supplier.ip.clone(), offer_id))
            .is_some()
        {
            info!(offer = %offer_id, supplier = %from_supplier, "offer removed");
        }
    }

    /// Replaces a stored offer's advertised payload in place. Returns
    /// whether a matching offer existed.
    pub fn handle_update_offer(&self, from_supplier: &NodeRef, offer: &OfferSpec) -> bool {
        let mut state = self.shared.state.lock().expect("trader state lock");
        match state.offers.get_mut(&(from_supplier.ip.clone(), offer.id)) {
            Some(stored) => {
                stored.amount = offer.amount;
                stored.resources = offer.resources;
                stored.last_refreshed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Answers a discovery query.
    ///
    /// Local offers win. When the trader holds nothing and `relay` is
    /// permitted, the cached same-class predecessor and successor are asked
    /// once (never further - relayed queries carry `relay = false`). A
    /// neighbor that fails or answers empty is dropped from the cache.
    pub async fn handle_get_offers(&self, from_node: &NodeRef, relay: bool) -> Vec<AvailableOffer> {
        let (local_offers, neighbors) = {
            let state = self.shared.state.lock().expect("trader state lock");
            let offers: Vec<AvailableOffer> = state
                .offers
                .iter()
                .map(|((_, offer_id), stored)| AvailableOffer {
                    supplier_ip: stored.supplier.ip.clone(),
                    supplier_guid: stored.supplier.guid,
                    offer_id: *offer_id,
                    amount: stored.amount,
                    resources: stored.resources,
                })
                .collect();
            let neighbors = vec![state.predecessor.clone(), state.successor.clone()];
            (offers, neighbors)
        };

        if !local_offers.is_empty() || !relay {
            return local_offers;
        }

        debug!(from = %from_node, "no local offers, relaying to cached neighbors");
        let queries: Vec<_> = neighbors
            .iter()
            .flatten()
            .filter(|n| self.same_class(n.guid))
            .map(|neighbor| {
                let request = GetOffers {
                    from_node: from_node.clone(),
                    to_trader: neighbor.clone(),
                    relay: false,
                };
                let comm = self.shared.comm.clone();
                let neighbor = neighbor.clone();
                async move { (neighbor, comm.get_offers(request).await) }
            })
            .collect();

        let mut union = Vec::new();
        for (neighbor, result) in join_all(queries).await {
            match result {
                Ok(response) if !response.offers.is_empty() => {
                    union.extend(response.offers);
                }
                Ok(_) => {
                    debug!(neighbor = %neighbor, "neighbor answered empty, dropping from cache");
                    self.forget_neighbor(&neighbor);
                }
                Err(err) => {
                    warn!(neighbor = %neighbor, error = %err, "neighbor query failed");
                    self.forget_neighbor(&neighbor);
                }
            }
        }
        union
    }

    /// Handles a ring advertisement: `offering` is a same-class trader that
    /// currently holds offers.
    ///
    /// The side the advertisement arrived from decides which cache slot it
    /// updates, and a trader that holds offers of its own never relays -
    /// it is a relay dead-end by design of the gossip.
    pub async fn handle_advertise_neighbor(&self, from_trader: &NodeRef, offering: &NodeRef) {
        if !self.same_class(offering.guid) {
            debug!(offering = %offering, "ignoring advertisement for a different class");
            return;
        }

        let from_successor_side = from_trader.guid > self.shared.local.guid;
        let holds_offers = {
            let mut state = self.shared.state.lock().expect("trader state lock");
            if from_successor_side {
                state.successor = Some(offering.clone());
            } else {
                state.predecessor = Some(offering.clone());
            }
            !state.offers.is_empty()
        };

        if holds_offers {
            return;
        }

        // Relay outward, away from the originator.
        let outward = if from_successor_side {
            self.ring_neighbor(Direction::Predecessor).await
        } else {
            self.ring_neighbor(Direction::Successor).await
        };

        if let Some(next) = outward {
            let request = AdvertiseOffersNeighbor {
                from_trader: self.shared.local.clone(),
                to_neighbor: next.clone(),
                offering: offering.clone(),
            };
            if let Err(err) = self.shared.comm.advertise_offers_neighbor(request).await {
                debug!(neighbor = %next, error = %err, "advertisement relay lost");
            }
        }
    }

    /// One refresh pass: ping the supplier behind every stored offer that
    /// is not already awaiting an answer.
    ///
    /// Pings run as independent tasks so one unreachable supplier cannot
    /// stall the loop or delay the others; each result is applied back
    /// under the state lock as it arrives.
    pub fn tick_refresh(&self) {
        let due: Vec<(OfferKey, NodeRef)> = {
            let mut state = self.shared.state.lock().expect("trader state lock");
            state
                .offers
                .iter_mut()
                .filter(|(_, offer)| !offer.waiting_for_refresh)
                .map(|(key, offer)| {
                    offer.waiting_for_refresh = true;
                    (key.clone(), offer.supplier.clone())
                })
                .collect()
        };

        for (key, supplier) in due {
            let trader = self.clone();
            tokio::spawn(async move {
                let request = RefreshOffer {
                    from_trader: trader.shared.local.guid,
                    offer_id: key.1,
                };
                let outcome = match trader
                    .shared
                    .comm
                    .refresh_offer(request, &supplier.ip)
                    .await
                {
                    Ok(response) if response.refreshed => RefreshOutcome::Confirmed,
                    Ok(_) => RefreshOutcome::Disowned,
                    Err(err) => {
                        debug!(supplier = %supplier, error = %err, "refresh ping failed");
                        RefreshOutcome::Unreachable
                    }
                };
                trader.apply_refresh_outcome(&key, outcome);
            });
        }
    }

    /// Periodic spread: a trader holding offers re-advertises itself so
    /// neighbor caches recover from staleness.
    pub async fn tick_spread(&self) {
        let holds_offers = {
            let state = self.shared.state.lock().expect("trader state lock");
            !state.offers.is_empty()
        };
        if holds_offers {
            self.advertise_to_neighbors().await;
        }
    }

    /// Snapshot of stored offers, for diagnostics and tests.
    pub fn stored_offers(&self) -> Vec<StoredOffer> {
        let state = self.shared.state.lock().expect("trader state lock");
        state.offers.values().cloned().collect()
    }

    /// Current soft neighbor cache `(predecessor, successor)`.
    pub fn cached_neighbors(&self) -> (Option<NodeRef>, Option<NodeRef>) {
        let state = self.shared.state.lock().expect("trader state lock");
        (state.predecessor.clone(), state.successor.clone())
    }

    fn apply_refresh_outcome(&self, key: &OfferKey, outcome: RefreshOutcome) {
        let mut state = self.shared.state.lock().expect("trader state lock");
        let offer = match state.offers.get_mut(key) {
            Some(offer) => offer,
            None => return, // Removed while the ping was in flight
        };
        offer.waiting_for_refresh = false;

        match outcome {
            RefreshOutcome::Confirmed => {
                offer.last_refreshed = Instant::now();
                offer.refreshes_failed = 0;
            }
            RefreshOutcome::Disowned => {
                info!(offer = %key.1, supplier = %key.0, "supplier disowned offer, dropping");
                state.offers.remove(key);
            }
            RefreshOutcome::Unreachable => {
                offer.refreshes_failed += 1;
                if offer.refreshes_failed >= self.shared.config.max_refreshes_failed {
                    warn!(
                        offer = %key.1,
                        supplier = %key.0,
                        failures = self.shared.config.max_refreshes_failed,
                        "supplier unreachable, dropping offer"
                    );
                    state.offers.remove(key);
                }
            }
        }
    }

    /// Tells both same-class ring neighbors that this trader holds offers.
    async fn advertise_to_neighbors(&self) {
        for direction in [Direction::Predecessor, Direction::Successor] {
            if let Some(neighbor) = self.ring_neighbor(direction).await {
                let request = AdvertiseOffersNeighbor {
                    from_trader: self.shared.local.clone(),
                    to_neighbor: neighbor.clone(),
                    offering: self.shared.local.clone(),
                };
                if let Err(err) = self.shared.comm.advertise_offers_neighbor(request).await {
                    debug!(neighbor = %neighbor, error = %err, "advertisement lost");
                }
            }
        }
    }

    /// Live ring neighbor on the given side, restricted to the same
    /// resource class. Crossing a partition boundary ends the ring walk for
    /// this trader's purposes.
    async fn ring_neighbor(&self, direction: Direction) -> Option<NodeRef> {
        let key = match self.shared.local.guid.to_bytes(self.shared.mapping.bits()) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "cannot encode neighbor key");
                return None;
            }
        };

        let neighbors = match self.shared.overlay.neighbors(&key).await {
            Ok(neighbors) => neighbors,
            Err(err) => {
                debug!(error = %err, "neighbor lookup failed");
                return None;
            }
        };

        let local = self.shared.local.guid;
        neighbors
            .into_iter()
            .filter(|n| n.guid != local && self.same_class(n.guid))
            .filter(|n| match direction {
                Direction::Predecessor => n.guid < local,
                Direction::Successor => n.guid > local,
            })
            .min_by_key(|n| n.guid.distance(&local))
    }

    fn same_class(&self, guid: Guid) -> bool {
        self.shared
            .mapping
            .resources_by_guid(guid)
            .map(|handled| handled == self.shared.handled)
            .unwrap_or(false)
    }

    fn forget_neighbor(&self, neighbor: &NodeRef) {
        let mut state = self.shared.state.lock().expect("trader state lock");
        if state.predecessor.as_ref() == Some(neighbor) {
            state.predecessor = None;
        }
        if state.successor.as_ref() == Some(neighbor) {
            state.successor = None;
        }
    }
}

#[derive(Copy, Clone)]
enum Direction {
    Predecessor,
    Successor,
}
