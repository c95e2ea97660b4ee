//! # Protocol Client Seam
//!
//! Outbound half of the remote protocol. The embedding transport (HTTP,
//! QUIC, whatever the deployment uses) implements [`MarketComm`]; suppliers,
//! traders, and strategies only ever talk through this trait.
//!
//! Routing is by the `to_*` node reference carried inside each message. A
//! transport error means "peer unreachable or timed out"; protocol-level
//! rejection travels inside the typed responses instead.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{
    AdvertiseOffersNeighbor, CreateOffer, GetOffers, GetOffersResponse, OfferAck, RefreshOffer,
    RefreshOfferResponse, RemoveOffer, UpdateOffer,
};

/// Typed client for the node-to-node marketplace protocol.
#[async_trait]
pub trait MarketComm: Send + Sync {
    async fn create_offer(&self, msg: CreateOffer) -> Result<OfferAck>;

    async fn refresh_offer(&self, msg: RefreshOffer, supplier_ip: &str)
        -> Result<RefreshOfferResponse>;

    async fn remove_offer(&self, msg: RemoveOffer) -> Result<OfferAck>;

    async fn update_offer(&self, msg: UpdateOffer) -> Result<OfferAck>;

    async fn get_offers(&self, msg: GetOffers) -> Result<GetOffersResponse>;

    async fn advertise_offers_neighbor(&self, msg: AdvertiseOffersNeighbor) -> Result<OfferAck>;
}
