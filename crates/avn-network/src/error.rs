//! Network error types.

use crate::peer::PeerId;
use thiserror::Error;

/// Network errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// A peer with this id is already registered.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(PeerId),

    /// No peer with this id is registered.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The peer connection has been closed.
    #[error("Peer closed: {0}")]
    PeerClosed(PeerId),

    /// The outbound queue of the connection rejected the message.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
