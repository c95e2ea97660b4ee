//! # Tradeplane
//!
//! Tradeplane is the market plane of a decentralized edge-compute mesh:
//! every participating node owns some CPU/RAM capacity, advertises it into a
//! structured overlay, and other nodes discover and reserve that capacity to
//! place workloads - with no central broker. It provides:
//!
//! - **Resource Mapping**: deterministic partitioning of a flat identifier
//!   space into resource classes, so "who brokers 2-core/2 GB offers" is a
//!   pure function of the overlay coordinates
//! - **Supply Protocol**: suppliers advertise their spare capacity to the
//!   traders responsible for it and keep the offers fresh
//! - **Discovery Protocol**: buyers walk the partition tree (escalating to
//!   larger classes when needed) and rank the candidate offers
//! - **Liveness**: two independent failure detectors reclaim offers when
//!   traders or suppliers disappear
//!
//! ## Architecture
//!
//! The crate is a library; the overlay (DHT), the RPC transport, and the
//! container runtime are external collaborators behind traits.
//!
//! - [`guid`]: ring identifiers and percentage-sliced ranges
//! - [`resources`]: resource vectors and checked bookkeeping
//! - [`mapping`]: the static partition tree and its fitting policies
//! - [`hints`]: adaptive partition hit/miss statistics
//! - [`messages`]: typed payloads of the remote protocol
//! - [`overlay`] / [`comm`]: the consumed collaborator seams
//! - [`supplier`]: per-node capacity owner and offer lifecycle
//! - [`trader`]: per-virtual-node offer broker
//! - [`strategies`]: pluggable placement/discovery algorithms
//! - [`policy`]: ranking of discovered offers
//! - [`node`]: wiring, lifecycle, and protocol routing
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tradeplane::{Config, MarketNode};
//! use tradeplane::resources::Resources;
//! use tradeplane::guid::Guid;
//!
//! let node = MarketNode::new(
//!     Config::default(),
//!     Resources::new(1, 4, 4_096),
//!     Guid::new(0x2f00),
//!     overlay, // Arc<dyn Overlay>
//!     comm,    // Arc<dyn MarketComm>
//! )?;
//! node.join_market("10.0.0.7", 7400).await?;
//!
//! let candidates = node.find_resources(&Resources::new(0, 2, 512)).await;
//! ```

pub mod comm;
pub mod config;
pub mod guid;
pub mod hints;
pub mod mapping;
pub mod messages;
pub mod node;
pub mod overlay;
pub mod policy;
pub mod resources;
pub mod strategies;
pub mod supplier;
pub mod trader;

pub use config::Config;
pub use node::MarketNode;
