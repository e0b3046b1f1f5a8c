//! # avn-network
//!
//! Peer-facing layer of the sync core.
//!
//! This crate provides:
//! - The `PeerSet` registry with best-peer and idle-peer views
//! - `Peer` handles composed of a transport plus sync bookkeeping
//! - The `PeerTransport` request interface and inbound `Packet` type
//! - Peer reputation with decaying penalties and rate estimates

mod error;
mod message;
mod peer;
mod peer_set;
mod penalties;
mod scoring;
mod transport;

pub use error::{NetworkError, NetworkResult};
pub use message::Packet;
pub use peer::{Capability, NullTransport, Peer, PeerHead, PeerId, RequestKind};
pub use peer_set::PeerSet;
pub use penalties::{Penalties, PenaltyReason};
pub use scoring::{PeerScore, RateTracker, DEFAULT_THROUGHPUT};
pub use transport::{DisconnectReason, PeerTransport};

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 66;
