//! The outbound half of a peer connection.

use crate::NetworkResult;
use avn_chain::H256;
use std::fmt;

/// Why we are closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Local shutdown or explicit request.
    Requested,
    /// The peer has nothing useful for us.
    UselessPeer,
    /// The peer broke the protocol.
    ProtocolViolation,
    /// The peer did not answer in time.
    Unresponsive,
    /// The peer served an invalid chain.
    InvalidChain,
    /// The peer's chain conflicts with our pinned checkpoint.
    CheckpointMismatch,
    /// The peer's chain conflicts with a whitelisted block.
    WhitelistMismatch,
    /// The peer cannot serve sync data while we are fast syncing.
    Unsynced,
    /// A connection with this id already exists.
    AlreadyConnected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "disconnect requested",
            Self::UselessPeer => "useless peer",
            Self::ProtocolViolation => "protocol violation",
            Self::Unresponsive => "unresponsive",
            Self::InvalidChain => "invalid chain",
            Self::CheckpointMismatch => "untrusted checkpoint mismatch",
            Self::WhitelistMismatch => "whitelist mismatch",
            Self::Unsynced => "unsynced peer",
            Self::AlreadyConnected => "already connected",
        };
        f.write_str(s)
    }
}

/// Request side of the wire protocol for one peer.
///
/// Every call only queues the request; the reply arrives later as an inbound
/// packet on the peer's connection task. Implementations must not block.
pub trait PeerTransport: Send + Sync {
    fn request_headers_by_hash(
        &self,
        origin: H256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()>;

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()>;

    fn request_bodies(&self, hashes: Vec<H256>) -> NetworkResult<()>;

    fn request_receipts(&self, hashes: Vec<H256>) -> NetworkResult<()>;

    fn request_node_data(&self, hashes: Vec<H256>) -> NetworkResult<()>;

    fn request_pooled_transactions(&self, hashes: Vec<H256>) -> NetworkResult<()>;

    /// Close the connection.
    fn disconnect(&self, reason: DisconnectReason);
}
