//! # Supplier
//!
//! One supplier runs per physical node. It owns the node's true free
//! capacity, decides which resource classes to advertise, places offers with
//! the traders responsible for those classes, and manages the lifecycle of
//! its outstanding offers.
//!
//! # Bookkeeping Model
//!
//! `available` tracks *uncommitted* capacity: placing an offer subtracts the
//! advertised vector, withdrawing or evicting one returns it. Reserving
//! through an offer reclaims the offer's vector and consumes the requested
//! share in a single locked step, so `0 <= available <= max` holds after
//! every operation. A violation of that corridor is a bookkeeping bug: the
//! supplier reports it as [`ResourceError::ContractViolation`], poisons
//! itself, and stops its loop rather than clamping.
//!
//! # Failure Detection
//!
//! Traders holding this supplier's offers ping it periodically
//! ([`Supplier::refresh_offer`]). An offer that goes a full
//! `refresh_missed_timeout` without a ping accrues one miss; at
//! `max_refreshes_missed` misses the responsible trader is presumed dead and
//! the offer is evicted, its resources returned to the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::guid::Guid;
use crate::messages::{CreateOffer, NodeRef, OfferId, OfferSpec, RemoveOffer};
use crate::resources::{ResourceError, Resources};
use crate::strategies::{OfferingStrategy, StrategyContext};

/// An offer this supplier has successfully placed with a remote trader.
#[derive(Clone, Debug)]
pub struct ActiveOffer {
    /// Capacity committed to the offer
    pub resources: Resources,
    /// Reservations the offer backs
    pub amount: u32,
    /// The trader recorded as responsible for the offer
    pub trader: NodeRef,
    /// When the last refresh ping arrived (or the offer was created)
    pub last_refreshed: Instant,
    /// Refresh windows that elapsed without a ping
    pub refreshes_missed: u32,
}

struct SupplierState {
    max: Resources,
    available: Resources,
    offers: HashMap<OfferId, ActiveOffer>,
    next_offer_id: u64,
    /// Set when bookkeeping broke; the loop observes this and stops.
    poisoned: bool,
}

struct ServiceHandle {
    stop_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

struct SupplierShared {
    config: Config,
    ctx: Arc<StrategyContext>,
    strategy: Arc<dyn OfferingStrategy>,
    state: Mutex<SupplierState>,
    /// Nudged whenever capacity changes, so the next supply cycle runs
    /// without waiting out the full interval.
    supply_nudge: Notify,
    service: Mutex<Option<ServiceHandle>>,
}

/// The per-node capacity owner. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supplier {
    shared: Arc<SupplierShared>,
}

impl Supplier {
    /// Creates a supplier owning `max` capacity. Call
    /// [`start`](Self::start) to begin advertising.
    pub fn new(
        config: Config,
        max: Resources,
        ctx: Arc<StrategyContext>,
        strategy: Arc<dyn OfferingStrategy>,
    ) -> Self {
        Supplier {
            shared: Arc::new(SupplierShared {
                config,
                ctx,
                strategy,
                state: Mutex::new(SupplierState {
                    max,
                    available: max,
                    offers: HashMap::new(),
                    next_offer_id: 0,
                    poisoned: false,
                }),
                supply_nudge: Notify::new(),
                service: Mutex::new(None),
            }),
        }
    }

    /// Starts the supply and refresh-check loops.
    ///
    /// Idempotent - calling multiple times has no effect.
    pub fn start(&self) {
        let mut guard = self.shared.service.lock().expect("supplier service lock");
        if guard.is_some() {
            return; // Already running
        }

        let (tx, mut rx) = watch::channel(false);
        let supplier = self.clone();

        let join_handle = tokio::spawn(async move {
            let cfg = &supplier.shared.config;
            let tick = cfg.supplying_interval.min(cfg.refreshes_check_interval);
            let mut ticker = interval(tick);
            ticker.tick().await; // Immediate first tick

            supplier.tick_supply().await;
            let mut last_supply = Instant::now();
            let mut last_refresh_check = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        if now.duration_since(last_supply) >= cfg.supplying_interval {
                            supplier.tick_supply().await;
                            last_supply = now;
                        }
                        if now.duration_since(last_refresh_check) >= cfg.refreshes_check_interval {
                            supplier.tick_refresh_check();
                            last_refresh_check = now;
                        }
                    }
                    _ = supplier.shared.supply_nudge.notified() => {
                        supplier.tick_supply().await;
                        last_supply = Instant::now();
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() {
                            break;
                        }
                    }
                }

                if supplier.poisoned() {
                    error!("supplier bookkeeping poisoned, stopping loop");
                    break;
                }
            }
            debug!("supplier stopped");
        });

        *guard = Some(ServiceHandle {
            stop_tx: tx,
            join_handle,
        });
    }

    /// Stops the background loops gracefully.
    pub async fn stop(&self) {
        let handle = self.shared.service.lock().expect("supplier service lock").take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let _ = handle.join_handle.await;
        }
    }

    /// One supply cycle: reconcile what is advertised against what this
    /// node can currently back.
    ///
    /// The plan is computed from total capacity (free plus committed), the
    /// strategy picks candidate partitions largest-first, and a greedy pack
    /// decides which of them fit. Offers for partitions that fell out of
    /// the plan are withdrawn; missing plan entries are placed.
    pub async fn tick_supply(&self) {
        let shared = &self.shared;

        // Plan under the lock, against a consistent snapshot.
        let (plan, withdraw) = {
            let state = shared.state.lock().expect("supplier state lock");
            if state.poisoned {
                return;
            }

            let mut total = state.available;
            for offer in state.offers.values() {
                total = match total.checked_add(&offer.resources) {
                    Some(total) => total,
                    None => {
                        warn!("committed offers overflow total capacity");
                        return;
                    }
                };
            }
            if total.is_zero() {
                return;
            }

            let candidates = shared.strategy.advertised_partitions(&shared.ctx, &total);
            let plan = pack_partitions(&candidates, &total);

            // Multiset diff current offers vs plan.
            let mut wanted: HashMap<Resources, u32> = HashMap::new();
            for partition in &plan {
                *wanted.entry(*partition).or_insert(0) += 1;
            }

            let mut withdraw: Vec<(OfferId, ActiveOffer)> = Vec::new();
            for (id, offer) in &state.offers {
                match wanted.get_mut(&offer.resources) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => withdraw.push((*id, offer.clone())),
                }
            }

            let create: Vec<Resources> = wanted
                .into_iter()
                .flat_map(|(partition, count)| {
                    std::iter::repeat(partition).take(count as usize)
                })
                .collect();

            (create, withdraw)
        };

        for (id, offer) in withdraw {
            self.withdraw_offer(id, offer);
        }

        for partition in plan {
            self.create_offer(&partition).await;
        }
    }

    /// Places one offer of class `partition` with a remote trader.
    ///
    /// On any failure the free pool is left untouched and the partition is
    /// simply retried on the next cycle.
    pub async fn create_offer(&self, partition: &Resources) {
        let shared = &self.shared;

        let trader = match shared.strategy.place_offer(&shared.ctx, partition).await {
            Ok(trader) => trader,
            Err(err) => {
                info!(partition = %partition, error = %err, "no placement this cycle");
                return;
            }
        };

        let offer_id = {
            let mut state = shared.state.lock().expect("supplier state lock");
            let id = OfferId(state.next_offer_id);
            state.next_offer_id += 1;
            id
        };

        let request = CreateOffer {
            from_supplier: shared.ctx.local.clone(),
            to_trader: trader.clone(),
            offer: OfferSpec {
                id: offer_id,
                amount: shared.config.offers_amount,
                resources: *partition,
            },
        };

        match shared.ctx.comm.create_offer(request).await {
            Ok(ack) if ack.accepted => {}
            Ok(_) => {
                info!(partition = %partition, trader = %trader, "trader declined offer");
                return;
            }
            Err(err) => {
                warn!(trader = %trader, error = %err, "create offer failed");
                return;
            }
        }

        // Commit. Capacity may have been reserved while the placement was
        // in flight; if the partition no longer fits, take the offer back.
        let committed = {
            let mut state = shared.state.lock().expect("supplier state lock");
            match state.available.checked_sub(partition) {
                Some(rest) => {
                    state.available = rest;
                    state.offers.insert(
                        offer_id,
                        ActiveOffer {
                            resources: *partition,
                            amount: shared.config.offers_amount,
                            trader: trader.clone(),
                            last_refreshed: Instant::now(),
                            refreshes_missed: 0,
                        },
                    );
                    true
                }
                None => false,
            }
        };

        if committed {
            info!(offer = %offer_id, partition = %partition, trader = %trader, "offer placed");
        } else {
            debug!(offer = %offer_id, "capacity reserved mid-placement, rolling back");
            self.notify_offer_removed(offer_id, trader);
        }
    }

    /// Atomically reserves `requested` out of an active offer.
    ///
    /// Returns `Ok(false)` when the offer is unknown or cannot satisfy the
    /// request - an expected race under eventual consistency, the caller
    /// retries against a different offer. `Err` means the bookkeeping
    /// corridor broke, which is fatal for this instance.
    pub fn obtain_resources(
        &self,
        offer_id: OfferId,
        requested: &Resources,
    ) -> Result<bool, ResourceError> {
        let shared = &self.shared;
        let trader = {
            let mut state = shared.state.lock().expect("supplier state lock");

            let offer = match state.offers.get(&offer_id) {
                Some(offer) => offer.clone(),
                None => return Ok(false),
            };
            if !offer.resources.contains(requested) {
                return Ok(false);
            }

            // The offer's committed vector comes back into play and the
            // requested share leaves it.
            let reclaimed = match state.available.checked_add(&offer.resources) {
                Some(reclaimed) => reclaimed,
                None => {
                    state.poisoned = true;
                    let err =
                        ResourceError::ContractViolation("capacity overflow on reclaim".into());
                    error!(error = %err, "reservation broke the bookkeeping corridor");
                    return Err(err);
                }
            };
            let next = match reclaimed.checked_sub(requested) {
                Some(next) => next,
                None => return Ok(false),
            };
            if let Err(err) = next.ensure_within(&state.max) {
                state.poisoned = true;
                error!(error = %err, "reservation broke the bookkeeping corridor");
                return Err(err);
            }

            state.available = next;
            state.offers.remove(&offer_id);
            offer.trader
        };

        info!(offer = %offer_id, requested = %requested, "resources reserved");
        self.notify_offer_removed(offer_id, trader);
        shared.supply_nudge.notify_one();
        Ok(true)
    }

    /// Returns previously reserved capacity to the free pool and triggers a
    /// fresh supply cycle.
    pub fn return_resources(&self, vector: &Resources) -> Result<(), ResourceError> {
        {
            let mut state = self.shared.state.lock().expect("supplier state lock");
            let next = state.available.checked_add(vector).ok_or_else(|| {
                ResourceError::ContractViolation("capacity overflow on return".into())
            })?;
            if let Err(err) = next.ensure_within(&state.max) {
                state.poisoned = true;
                error!(error = %err, "returned capacity exceeds the node maximum");
                return Err(err);
            }
            state.available = next;
        }

        info!(returned = %vector, "resources returned");
        self.shared.supply_nudge.notify_one();
        Ok(())
    }

    /// One refresh-check pass: count missed refresh windows and evict
    /// offers whose trader is presumed dead.
    pub fn tick_refresh_check(&self) {
        let cfg = &self.shared.config;
        let mut evicted = Vec::new();
        let mut reclaim_failed = false;

        {
            let mut state = self.shared.state.lock().expect("supplier state lock");
            if state.poisoned {
                return;
            }

            let now = Instant::now();
            let mut dead = Vec::new();
            for (id, offer) in state.offers.iter_mut() {
                if now.duration_since(offer.last_refreshed) < cfg.refresh_missed_timeout {
                    continue;
                }
                offer.refreshes_missed += 1;
                offer.last_refreshed = now;
                if offer.refreshes_missed >= cfg.max_refreshes_missed {
                    dead.push(*id);
                } else {
                    debug!(offer = %id, misses = offer.refreshes_missed, "refresh window missed");
                }
            }

            for id in dead {
                if let Some(offer) = state.offers.remove(&id) {
                    match state.available.checked_add(&offer.resources) {
                        Some(next) => state.available = next,
                        None => {
                            state.poisoned = true;
                            reclaim_failed = true;
                        }
                    }
                    evicted.push((id, offer.resources));
                }
            }
        }

        if reclaim_failed {
            error!("evicted capacity overflowed the free pool");
            return;
        }

        for (id, resources) in &evicted {
            warn!(offer = %id, resources = %resources, "offer evicted, trader presumed dead");
        }
        if !evicted.is_empty() {
            self.shared.supply_nudge.notify_one();
        }
    }

    /// Accepts a liveness ping from a trader.
    ///
    /// Only the trader recorded as responsible for the offer is honoured;
    /// anything else is cross-talk from a stale handoff and is rejected
    /// with `false`.
    pub fn refresh_offer(&self, offer_id: OfferId, from_trader: Guid) -> bool {
        let mut state = self.shared.state.lock().expect("supplier state lock");
        match state.offers.get_mut(&offer_id) {
            Some(offer) if offer.trader.guid == from_trader => {
                offer.last_refreshed = Instant::now();
                offer.refreshes_missed = 0;
                true
            }
            Some(_) => {
                debug!(offer = %offer_id, from = %from_trader, "refresh from wrong trader rejected");
                false
            }
            None => false,
        }
    }

    /// Free capacity not currently committed to any offer.
    pub fn available_resources(&self) -> Resources {
        self.shared.state.lock().expect("supplier state lock").available
    }

    /// The node's fixed capacity ceiling.
    pub fn max_resources(&self) -> Resources {
        self.shared.state.lock().expect("supplier state lock").max
    }

    /// Snapshot of the outstanding offers.
    pub fn active_offers(&self) -> Vec<(OfferId, ActiveOffer)> {
        let state = self.shared.state.lock().expect("supplier state lock");
        state.offers.iter().map(|(id, o)| (*id, o.clone())).collect()
    }

    /// Whether bookkeeping broke and the instance shut itself down.
    pub fn poisoned(&self) -> bool {
        self.shared.state.lock().expect("supplier state lock").poisoned
    }

    fn withdraw_offer(&self, id: OfferId, offer: ActiveOffer) {
        let mut state = self.shared.state.lock().expect("supplier state lock");
        if state.offers.remove(&id).is_none() {
            return;
        }
        match state.available.checked_add(&offer.resources) {
            Some(next) => state.available = next,
            None => {
                state.poisoned = true;
                error!(offer = %id, "withdrawn capacity overflowed the free pool");
                return;
            }
        }
        drop(state);

        info!(offer = %id, partition = %offer.resources, "offer withdrawn");
        self.notify_offer_removed(id, offer.trader);
    }

    /// Best-effort removal notice to the trader holding an offer. Failures
    /// are fine: the trader's own refresh loop discovers the truth.
    fn notify_offer_removed(&self, offer_id: OfferId, trader: NodeRef) {
        let comm = self.shared.ctx.comm.clone();
        let from_supplier = self.shared.ctx.local.clone();
        tokio::spawn(async move {
            let request = RemoveOffer {
                from_supplier,
                to_trader: trader.clone(),
                offer_id,
            };
            if let Err(err) = comm.remove_offer(request).await {
                debug!(offer = %offer_id, trader = %trader, error = %err, "remove notice lost");
            }
        });
    }

}

/// Greedy largest-first packing of candidate partitions into `total`
/// capacity. Each candidate is taken at most once; whatever does not fit is
/// skipped so smaller candidates can cover the remainder.
fn pack_partitions(candidates: &[Resources], total: &Resources) -> Vec<Resources> {
    let mut remaining = *total;
    let mut plan = Vec::new();
    for partition in candidates {
        if let Some(rest) = remaining.checked_sub(partition) {
            plan.push(*partition);
            remaining = rest;
        }
    }
    plan
}
