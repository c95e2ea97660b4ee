//! # Overlay Seam
//!
//! The structured overlay (DHT) is an external collaborator. This module
//! pins down the primitive surface the marketplace consumes from it and the
//! membership callback it hands back, nothing more.
//!
//! Keys cross the seam as fixed-width identifier bytes (see
//! [`Guid::to_bytes`](crate::guid::Guid::to_bytes)) so the overlay never
//! needs to understand resource semantics.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::guid::Guid;
use crate::messages::NodeRef;

/// Callback surface through which the overlay reports which virtual nodes
/// this physical node currently owns.
///
/// The marketplace runs one trader per owned virtual node; arrivals and
/// departures drive trader lifecycle.
pub trait Membership: Send + Sync {
    fn virtual_node_added(&self, guid: Guid);
    fn virtual_node_removed(&self, guid: Guid);
}

/// The overlay lookup primitive consumed by the marketplace.
///
/// All methods fail with transport-shaped, opaque errors; callers treat a
/// failure as "peer unreachable right now" and fall back to their retry or
/// eviction policy.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Nodes responsible for `key` (fixed-width identifier bytes).
    async fn lookup(&self, key: &[u8]) -> Result<Vec<NodeRef>>;

    /// Ring-adjacent nodes of the given node identifier.
    async fn neighbors(&self, node_id: &[u8]) -> Result<Vec<NodeRef>>;

    /// Bootstraps a fresh overlay with this node as the first member.
    async fn create(&self, membership: Arc<dyn Membership>) -> Result<()>;

    /// Joins an existing overlay through a seed node.
    async fn join(
        &self,
        seed_ip: &str,
        seed_port: u16,
        membership: Arc<dyn Membership>,
    ) -> Result<()>;

    /// Leaves the overlay, releasing owned virtual nodes.
    async fn leave(&self) -> Result<()>;
}
