//! # Protocol Messages
//!
//! This module defines the message types of the marketplace's remote
//! protocol. The protocol follows an advertise/discover/reserve pattern:
//!
//! 1. **CreateOffer**: a supplier places spare capacity with the trader
//!    responsible for that resource class
//! 2. **RefreshOffer**: the trader periodically confirms the supplier is
//!    still alive and still backing the offer
//! 3. **GetOffers**: a buyer asks a trader for candidate offers, optionally
//!    letting the trader relay the query to its ring neighbors
//! 4. **AdvertiseOffersNeighbor**: traders gossip "I have offers" pointers
//!    along the ring so empty traders can relay
//!
//! The transport encoding is not part of this crate; these are the typed
//! payloads an embedding transport carries. Inbound payload decoding always
//! goes through [`deserialize_safe`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::guid::Guid;
use crate::hints::PartitionHint;
use crate::resources::Resources;

/// Per-supplier monotonic offer identifier.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct OfferId(pub u64);

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a node in the overlay: transport endpoint plus ring identifier.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct NodeRef {
    /// Transport endpoint, `host:port`
    pub ip: String,
    /// Ring coordinate
    pub guid: Guid,
}

impl NodeRef {
    pub fn new(ip: impl Into<String>, guid: Guid) -> Self {
        NodeRef {
            ip: ip.into(),
            guid,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ip, self.guid)
    }
}

/// The advertised payload of an offer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct OfferSpec {
    /// Supplier-local identifier
    pub id: OfferId,
    /// Number of identical reservations the offer backs
    pub amount: u32,
    /// Capacity of each reservation
    pub resources: Resources,
}

/// Request to place an offer with a trader.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CreateOffer {
    pub from_supplier: NodeRef,
    pub to_trader: NodeRef,
    pub offer: OfferSpec,
}

/// Acknowledgment of an offer placement, update, or removal.
///
/// `accepted == false` is an expected outcome (wrong resource class, unknown
/// offer), not a transport failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct OfferAck {
    pub accepted: bool,
}

/// Liveness ping from a trader to the supplier backing an offer.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RefreshOffer {
    /// Identity of the pinging trader; the supplier only honours the trader
    /// it recorded as responsible for the offer
    pub from_trader: Guid,
    pub offer_id: OfferId,
}

/// Response to a refresh ping.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RefreshOfferResponse {
    /// `false` means the offer is gone or the trader is no longer the
    /// recorded owner; the trader should drop it
    pub refreshed: bool,
}

/// Request to withdraw an offer from a trader.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RemoveOffer {
    pub from_supplier: NodeRef,
    pub to_trader: NodeRef,
    pub offer_id: OfferId,
}

/// Request to replace an offer's advertised payload in place.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UpdateOffer {
    pub from_supplier: NodeRef,
    pub to_trader: NodeRef,
    pub offer: OfferSpec,
}

/// Discovery query for a trader's stored offers.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GetOffers {
    pub from_node: NodeRef,
    pub to_trader: NodeRef,
    /// Whether the trader may forward the query to same-class ring
    /// neighbors when it holds nothing itself. Relayed queries carry
    /// `false` so a query travels at most one hop.
    pub relay: bool,
}

/// A discoverable offer, as returned to buyers.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AvailableOffer {
    pub supplier_ip: String,
    pub supplier_guid: Guid,
    pub offer_id: OfferId,
    pub amount: u32,
    pub resources: Resources,
}

/// Response to a discovery query.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct GetOffersResponse {
    pub offers: Vec<AvailableOffer>,
    /// Opportunistic piggyback of the answering node's partition statistics
    #[serde(default)]
    pub hints: Vec<PartitionHint>,
}

/// Ring gossip: `offering` is a trader of the same resource class that
/// currently holds offers.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AdvertiseOffersNeighbor {
    pub from_trader: NodeRef,
    pub to_neighbor: NodeRef,
    pub offering: NodeRef,
}

/// Maximum size for bincode deserialization, to keep a malformed or
/// malicious payload from exhausting memory.
pub const MAX_BINCODE_SIZE: u64 = 16 * 1024 * 1024;

/// Safely deserialize bincode data with size limits.
///
/// Unlike the default bincode deserializer, this function:
/// - Enforces a maximum payload size ([`MAX_BINCODE_SIZE`])
/// - Uses fixed-integer encoding for deterministic sizes
/// - Allows trailing bytes for forward compatibility
///
/// Always use this instead of raw bincode deserialization for
/// network-received data.
pub fn deserialize_safe<'a, T>(bytes: &'a [u8]) -> Result<T, bincode::Error>
where
    T: serde::Deserialize<'a>,
{
    use bincode::Options;

    bincode::DefaultOptions::new()
        .with_limit(MAX_BINCODE_SIZE)
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_offer_roundtrips_through_bincode() {
        let msg = CreateOffer {
            from_supplier: NodeRef::new("10.0.0.1:7400", Guid::new(42)),
            to_trader: NodeRef::new("10.0.0.2:7400", Guid::new(99)),
            offer: OfferSpec {
                id: OfferId(7),
                amount: 1,
                resources: Resources::new(0, 2, 512),
            },
        };

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: CreateOffer = deserialize_safe(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn deserialize_safe_rejects_garbage() {
        let garbage = vec![0xFFu8; 3];
        assert!(deserialize_safe::<GetOffersResponse>(&garbage).is_err());
    }
}
