//! Supplier Tests
//!
//! This module tests the capacity-owner side of the protocol:
//! - Supply reconciliation (greedy largest-first advertising)
//! - Reservation and return bookkeeping, including the fatal corridor
//! - Missed-refresh detection and offer eviction
//! - Trader-identity checking on refresh pings

use std::sync::Arc;
use std::time::Duration;

use tradeplane::guid::Guid;
use tradeplane::hints::PartitionHints;
use tradeplane::mapping::ResourceMapping;
use tradeplane::messages::OfferId;
use tradeplane::resources::Resources;
use tradeplane::strategies::multiple::MultipleOfferStrategy;
use tradeplane::strategies::StrategyContext;
use tradeplane::supplier::Supplier;

use test_utils::*;

// ============================================================================
// Test Setup
// ============================================================================

const SUPPLIER_IP: &str = "127.0.0.1:7400";
const SMALL_TRADER_GUID: u128 = 30_000; // serves (0,1,256)
const LARGE_TRADER_GUID: u128 = 60_000; // serves (0,2,2048)

struct Setup {
    supplier: Supplier,
    comm: Arc<ScriptedComm>,
}

/// Builds a supplier over the two-tier layout, with one live trader per
/// partition unless `populate_ring` is false.
fn setup(max: Resources, populate_ring: bool) -> Setup {
    let mut config = test_config(two_tier_partitions());
    config.node_ip = SUPPLIER_IP.to_string();

    let ring = MockRing::new();
    if populate_ring {
        ring.add_node(node_ref("10.0.0.2:7400", SMALL_TRADER_GUID));
        ring.add_node(node_ref("10.0.0.3:7400", LARGE_TRADER_GUID));
    }

    let overlay = MockOverlay::new(ring.clone(), SUPPLIER_IP, vec![]);
    let comm = ScriptedComm::new();
    let mapping = Arc::new(ResourceMapping::new(config.guid_bits, &config.partitions).unwrap());

    let ctx = Arc::new(StrategyContext {
        mapping,
        overlay,
        comm: comm.clone(),
        hints: Arc::new(PartitionHints::new()),
        local: node_ref(SUPPLIER_IP, 7),
    });

    let supplier = Supplier::new(config, max, ctx, Arc::new(MultipleOfferStrategy::new()));
    Setup { supplier, comm }
}

fn offer_with_resources(supplier: &Supplier, resources: Resources) -> OfferId {
    supplier
        .active_offers()
        .into_iter()
        .find(|(_, offer)| offer.resources == resources)
        .map(|(id, _)| id)
        .expect("offer for partition")
}

// ============================================================================
// Supply Reconciliation
// ============================================================================

/// A node covering several partitions advertises one offer per covered
/// partition, largest first, committing capacity as it goes.
#[tokio::test]
async fn supply_covers_capacity_with_decreasing_offers() {
    let s = setup(Resources::new(0, 3, 2_304), true);

    s.supplier.tick_supply().await;

    let offers = s.supplier.active_offers();
    assert_eq!(offers.len(), 2);
    assert!(s.supplier.available_resources().is_zero());

    let large = offers
        .iter()
        .find(|(_, o)| o.resources == Resources::new(0, 2, 2_048))
        .expect("large offer");
    assert_eq!(large.1.trader.guid, Guid::new(LARGE_TRADER_GUID));

    let small = offers
        .iter()
        .find(|(_, o)| o.resources == Resources::new(0, 1, 256))
        .expect("small offer");
    assert_eq!(small.1.trader.guid, Guid::new(SMALL_TRADER_GUID));
}

/// Reconciliation is stable: a second pass with unchanged capacity places
/// nothing new and withdraws nothing.
#[tokio::test]
async fn supply_reconciliation_is_idempotent() {
    let s = setup(Resources::new(0, 3, 2_304), true);

    s.supplier.tick_supply().await;
    let first_pass = s.comm.calls().len();

    s.supplier.tick_supply().await;
    assert_eq!(s.supplier.active_offers().len(), 2);
    assert_eq!(s.comm.calls().len(), first_pass, "no new protocol traffic");
}

/// A declined placement leaves the free pool untouched; the partition is
/// simply retried next cycle.
#[tokio::test]
async fn declined_offers_do_not_consume_capacity() {
    let s = setup(Resources::new(0, 2, 2_048), true);
    s.comm.set_accept_create(false);

    s.supplier.tick_supply().await;

    assert!(s.supplier.active_offers().is_empty());
    assert_eq!(s.supplier.available_resources(), Resources::new(0, 2, 2_048));
}

/// With no live traders anywhere, the cycle is skipped cleanly.
#[tokio::test]
async fn empty_ring_skips_the_cycle() {
    let s = setup(Resources::new(0, 2, 2_048), false);

    s.supplier.tick_supply().await;

    assert!(s.supplier.active_offers().is_empty());
    assert_eq!(s.supplier.available_resources(), Resources::new(0, 2, 2_048));
}

// ============================================================================
// Reservation Bookkeeping
// ============================================================================

/// Reserving part of an offer consumes the requested share, deletes the
/// offer, and notifies the responsible trader.
#[tokio::test]
async fn obtain_consumes_requested_share_and_drops_offer() {
    let s = setup(Resources::new(0, 3, 2_304), true);
    s.supplier.tick_supply().await;

    let id = offer_with_resources(&s.supplier, Resources::new(0, 2, 2_048));
    let obtained = s
        .supplier
        .obtain_resources(id, &Resources::new(0, 1, 1_024))
        .unwrap();
    assert!(obtained);

    // Committed 2048/2-core vector comes back into play, minus the share
    // that was reserved.
    assert_eq!(s.supplier.available_resources(), Resources::new(0, 1, 1_024));
    assert_eq!(s.supplier.active_offers().len(), 1);

    // The removal notice is dispatched in the background.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(s
        .comm
        .calls()
        .iter()
        .any(|c| matches!(c, CommCall::Remove(msg) if msg.offer_id == id)));
}

/// Validation failures are expected races, reported as `false` with no
/// state change.
#[tokio::test]
async fn obtain_rejects_unknown_and_oversized_requests() {
    let s = setup(Resources::new(0, 2, 2_048), true);
    s.supplier.tick_supply().await;

    let id = offer_with_resources(&s.supplier, Resources::new(0, 2, 2_048));

    assert!(!s
        .supplier
        .obtain_resources(OfferId(9_999), &Resources::new(0, 1, 256))
        .unwrap());
    assert!(!s
        .supplier
        .obtain_resources(id, &Resources::new(0, 4, 256))
        .unwrap());

    assert_eq!(s.supplier.active_offers().len(), 1);
}

/// The bookkeeping corridor holds across an arbitrary obtain/return
/// sequence.
#[tokio::test]
async fn corridor_holds_across_obtain_and_return() {
    let max = Resources::new(0, 3, 2_304);
    let s = setup(max, true);
    s.supplier.tick_supply().await;

    let assert_corridor = |supplier: &Supplier| {
        let available = supplier.available_resources();
        assert!(
            max.contains(&available),
            "available {available} escaped the corridor"
        );
    };
    assert_corridor(&s.supplier);

    let id = offer_with_resources(&s.supplier, Resources::new(0, 2, 2_048));
    assert!(s
        .supplier
        .obtain_resources(id, &Resources::new(0, 2, 1_024))
        .unwrap());
    assert_corridor(&s.supplier);

    s.supplier
        .return_resources(&Resources::new(0, 2, 1_024))
        .unwrap();
    assert_corridor(&s.supplier);

    let id = offer_with_resources(&s.supplier, Resources::new(0, 1, 256));
    assert!(s
        .supplier
        .obtain_resources(id, &Resources::new(0, 1, 256))
        .unwrap());
    assert_corridor(&s.supplier);
}

/// Returning capacity that was never reserved breaks the corridor: a
/// loud, typed failure, never a clamp.
#[tokio::test]
async fn returning_unreserved_capacity_is_fatal() {
    let max = Resources::new(0, 2, 2_048);
    let s = setup(max, false);

    let err = s
        .supplier
        .return_resources(&Resources::new(0, 1, 1))
        .unwrap_err();
    assert!(err.to_string().contains("bookkeeping"));

    assert!(s.supplier.poisoned());
    assert_eq!(s.supplier.available_resources(), max, "never clamped");
}

// ============================================================================
// Missed-Refresh Detection
// ============================================================================

/// An offer whose trader stops pinging is evicted after the configured
/// number of missed windows, and its capacity returns to the pool.
#[tokio::test]
async fn silent_trader_offers_are_evicted() {
    let max = Resources::new(0, 3, 2_304);
    let mut config = test_config(two_tier_partitions());
    config.refresh_missed_timeout = Duration::from_millis(10);
    config.max_refreshes_missed = 2;

    let ring = MockRing::new();
    ring.add_node(node_ref("10.0.0.2:7400", SMALL_TRADER_GUID));
    ring.add_node(node_ref("10.0.0.3:7400", LARGE_TRADER_GUID));
    let overlay = MockOverlay::new(ring.clone(), SUPPLIER_IP, vec![]);
    let comm = ScriptedComm::new();
    let mapping = Arc::new(ResourceMapping::new(config.guid_bits, &config.partitions).unwrap());
    let ctx = Arc::new(StrategyContext {
        mapping,
        overlay,
        comm: comm.clone(),
        hints: Arc::new(PartitionHints::new()),
        local: node_ref(SUPPLIER_IP, 7),
    });
    let supplier = Supplier::new(config, max, ctx, Arc::new(MultipleOfferStrategy::new()));

    supplier.tick_supply().await;
    assert_eq!(supplier.active_offers().len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    supplier.tick_refresh_check();
    assert_eq!(supplier.active_offers().len(), 2, "one miss is tolerated");

    tokio::time::sleep(Duration::from_millis(20)).await;
    supplier.tick_refresh_check();
    assert!(supplier.active_offers().is_empty());
    assert_eq!(supplier.available_resources(), max);
}

/// A refresh ping resets the miss counter, keeping a healthy offer alive
/// indefinitely.
#[tokio::test]
async fn refresh_pings_keep_offers_alive() {
    let max = Resources::new(0, 2, 2_048);
    let mut config = test_config(two_tier_partitions());
    config.refresh_missed_timeout = Duration::from_millis(15);
    config.max_refreshes_missed = 2;

    let ring = MockRing::new();
    ring.add_node(node_ref("10.0.0.3:7400", LARGE_TRADER_GUID));
    let overlay = MockOverlay::new(ring.clone(), SUPPLIER_IP, vec![]);
    let comm = ScriptedComm::new();
    let mapping = Arc::new(ResourceMapping::new(config.guid_bits, &config.partitions).unwrap());
    let ctx = Arc::new(StrategyContext {
        mapping,
        overlay,
        comm: comm.clone(),
        hints: Arc::new(PartitionHints::new()),
        local: node_ref(SUPPLIER_IP, 7),
    });
    let supplier = Supplier::new(config, max, ctx, Arc::new(MultipleOfferStrategy::new()));

    supplier.tick_supply().await;
    let id = offer_with_resources(&supplier, Resources::new(0, 2, 2_048));

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supplier.refresh_offer(id, Guid::new(LARGE_TRADER_GUID)));
        supplier.tick_refresh_check();
        assert_eq!(supplier.active_offers().len(), 1);
    }
}

// ============================================================================
// Refresh Identity Check
// ============================================================================

/// Only the recorded responsible trader can refresh an offer; cross-talk
/// after a handoff is rejected without error.
#[tokio::test]
async fn refresh_from_the_wrong_trader_is_rejected() {
    let s = setup(Resources::new(0, 2, 2_048), true);
    s.supplier.tick_supply().await;

    let id = offer_with_resources(&s.supplier, Resources::new(0, 2, 2_048));

    assert!(s.supplier.refresh_offer(id, Guid::new(LARGE_TRADER_GUID)));
    assert!(!s.supplier.refresh_offer(id, Guid::new(SMALL_TRADER_GUID)));
    assert!(!s.supplier.refresh_offer(OfferId(404), Guid::new(LARGE_TRADER_GUID)));
}

// ============================================================================
// Background Loop
// ============================================================================

/// The service loop runs an immediate first supply cycle and stops
/// cooperatively.
#[tokio::test]
async fn background_loop_supplies_immediately_and_stops() {
    let s = setup(Resources::new(0, 3, 2_304), true);

    s.supplier.start();
    s.supplier.start(); // Idempotent
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.supplier.active_offers().len(), 2);

    s.supplier.stop().await;
}
