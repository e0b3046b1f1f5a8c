//! Sync error types.

use avn_chain::ChainError;
use avn_network::{DisconnectReason, NetworkError, PeerId, RequestKind};
use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Malformed, unrequested or out-of-state message.
    #[error("Protocol violation by {peer}: {reason}")]
    PeerProtocolViolation { peer: PeerId, reason: String },

    /// Request not answered before its deadline.
    #[error("Peer {0} unresponsive")]
    PeerUnresponsive(PeerId),

    /// Headers fail linkage, verification or the advertised difficulty.
    #[error("Invalid header chain from {peer}: {reason}")]
    InvalidHeaderChain { peer: PeerId, reason: String },

    /// Header batches could not be joined into a contiguous chain.
    #[error("Header gap after block {committed}, next buffered batch at {buffered}")]
    HeaderGap { committed: u64, buffered: u64 },

    /// Body roots do not match the header.
    #[error("Body of block {number} from {peer} does not match its header")]
    BodyHeaderMismatch { peer: PeerId, number: u64 },

    /// Receipt root does not match the header.
    #[error("Receipts of block {number} from {peer} do not match its header")]
    ReceiptHeaderMismatch { peer: PeerId, number: u64 },

    /// Peer's chain conflicts with the pinned checkpoint.
    #[error("Peer {peer} failed checkpoint challenge at block {number}")]
    UntrustedCheckpointMismatch { peer: PeerId, number: u64 },

    /// Peer's chain conflicts with a whitelisted block.
    #[error("Peer {peer} conflicts with whitelisted block {number}")]
    WhitelistMismatch { peer: PeerId, number: u64 },

    /// Peer cannot serve the data needed for fast sync.
    #[error("Peer {0} is not synced")]
    UnsyncedPeer(PeerId),

    /// Peer disconnected while work was pending on it.
    #[error("Peer {0} dropped")]
    PeerDropped(PeerId),

    /// A delivery arrived without a matching request.
    #[error("No pending {kind} request for {peer}")]
    NoPendingRequest { peer: PeerId, kind: RequestKind },

    /// A sync operation is already running.
    #[error("Sync already in progress")]
    Busy,

    /// The operation was canceled.
    #[error("Sync canceled")]
    Canceled,

    /// No peers available.
    #[error("No peers available for sync")]
    NoPeers,

    /// Sync stalled.
    #[error("Sync stalled: {0}")]
    Stalled(String),

    /// Overall operation deadline passed.
    #[error("Sync timeout")]
    Timeout,

    /// Component shut down.
    #[error("Component stopped: {0}")]
    Stopped(&'static str),

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Chain store error. Fatal for the operation.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl SyncError {
    pub fn protocol(peer: &PeerId, reason: impl Into<String>) -> Self {
        Self::PeerProtocolViolation {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_chain(peer: &PeerId, reason: impl Into<String>) -> Self {
        Self::InvalidHeaderChain {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }

    /// The peer at fault and how to disconnect it, for peer-attributable
    /// errors.
    pub fn peer_fault(&self) -> Option<(&PeerId, DisconnectReason)> {
        match self {
            Self::PeerProtocolViolation { peer, .. } => {
                Some((peer, DisconnectReason::ProtocolViolation))
            }
            Self::PeerUnresponsive(peer) => Some((peer, DisconnectReason::Unresponsive)),
            Self::InvalidHeaderChain { peer, .. }
            | Self::BodyHeaderMismatch { peer, .. }
            | Self::ReceiptHeaderMismatch { peer, .. } => {
                Some((peer, DisconnectReason::InvalidChain))
            }
            Self::UntrustedCheckpointMismatch { peer, .. } => {
                Some((peer, DisconnectReason::CheckpointMismatch))
            }
            Self::WhitelistMismatch { peer, .. } => Some((peer, DisconnectReason::WhitelistMismatch)),
            Self::UnsyncedPeer(peer) => Some((peer, DisconnectReason::Unsynced)),
            _ => None,
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_fault_mapping() {
        let peer = PeerId(vec![1]);
        let err = SyncError::UntrustedCheckpointMismatch {
            peer: peer.clone(),
            number: 10,
        };
        assert_eq!(
            err.peer_fault(),
            Some((&peer, DisconnectReason::CheckpointMismatch))
        );
        assert!(SyncError::Canceled.peer_fault().is_none());
        assert!(SyncError::HeaderGap {
            committed: 1,
            buffered: 5
        }
        .peer_fault()
        .is_none());
    }
}
