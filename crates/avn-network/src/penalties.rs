//! Penalty definitions for sync misbehaviour.
//!
//! Penalties accumulate per peer and decay over time. A peer crossing the
//! drop threshold is disconnected; critical violations cross it at once.

use crate::transport::DisconnectReason;
use std::fmt;

/// Penalty amounts.
pub struct Penalties;

impl Penalties {
    // ========== Minor (1-10 points) ==========

    /// Reply arrived but well after the expected round trip.
    pub const SLOW_RESPONSE: u32 = 2;

    /// Empty or partial reply to a request the peer advertised it could serve.
    pub const USELESS_RESPONSE: u32 = 5;

    /// Request not answered before its deadline.
    pub const MISSING_RESPONSE: u32 = 10;

    /// Delivery we never asked for.
    pub const UNREQUESTED_DELIVERY: u32 = 10;

    // ========== Moderate (20-100 points) ==========

    /// Announcement limit exceeded.
    pub const ANNOUNCEMENT_FLOOD: u32 = 50;

    /// Announced block number did not match the delivered header.
    pub const ANNOUNCEMENT_MISMATCH: u32 = 60;

    /// Body whose roots do not match its header.
    pub const BODY_MISMATCH: u32 = 100;

    /// Header failed verification.
    pub const INVALID_HEADER: u32 = 100;

    /// Block failed verification on import.
    pub const INVALID_BLOCK: u32 = 150;

    // ========== Critical (drop) ==========

    /// Message not allowed in the current protocol state.
    pub const PROTOCOL_VIOLATION: u32 = 500;

    /// Peer serves a chain conflicting with a pinned checkpoint.
    pub const CHECKPOINT_MISMATCH: u32 = 1000;

    // ========== Thresholds and decay ==========

    /// Penalty at which the peer is dropped.
    pub const DROP_THRESHOLD: u32 = 500;

    /// Penalty decay per minute.
    pub const DECAY_PER_MINUTE: u32 = 10;

    /// Saturation value.
    pub const MAX_PENALTY: u32 = 1000;
}

/// Why a peer is being penalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PenaltyReason {
    SlowResponse,
    UselessResponse,
    MissingResponse,
    UnrequestedDelivery,
    AnnouncementFlood,
    AnnouncementMismatch,
    BodyMismatch,
    InvalidHeader,
    InvalidBlock,
    ProtocolViolation,
    CheckpointMismatch,
}

impl PenaltyReason {
    /// Penalty points for this reason.
    pub fn penalty(&self) -> u32 {
        match self {
            Self::SlowResponse => Penalties::SLOW_RESPONSE,
            Self::UselessResponse => Penalties::USELESS_RESPONSE,
            Self::MissingResponse => Penalties::MISSING_RESPONSE,
            Self::UnrequestedDelivery => Penalties::UNREQUESTED_DELIVERY,
            Self::AnnouncementFlood => Penalties::ANNOUNCEMENT_FLOOD,
            Self::AnnouncementMismatch => Penalties::ANNOUNCEMENT_MISMATCH,
            Self::BodyMismatch => Penalties::BODY_MISMATCH,
            Self::InvalidHeader => Penalties::INVALID_HEADER,
            Self::InvalidBlock => Penalties::INVALID_BLOCK,
            Self::ProtocolViolation => Penalties::PROTOCOL_VIOLATION,
            Self::CheckpointMismatch => Penalties::CHECKPOINT_MISMATCH,
        }
    }

    /// Critical reasons drop the peer on the first offence.
    pub fn is_critical(&self) -> bool {
        self.penalty() >= Penalties::DROP_THRESHOLD
    }

    /// Disconnect reason reported when this penalty drops the peer.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::SlowResponse | Self::MissingResponse => DisconnectReason::Unresponsive,
            Self::UselessResponse => DisconnectReason::UselessPeer,
            Self::CheckpointMismatch => DisconnectReason::CheckpointMismatch,
            Self::InvalidHeader | Self::InvalidBlock | Self::BodyMismatch => {
                DisconnectReason::InvalidChain
            }
            Self::UnrequestedDelivery
            | Self::AnnouncementFlood
            | Self::AnnouncementMismatch
            | Self::ProtocolViolation => DisconnectReason::ProtocolViolation,
        }
    }
}

impl fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SlowResponse => "slow response",
            Self::UselessResponse => "useless response",
            Self::MissingResponse => "missing response",
            Self::UnrequestedDelivery => "unrequested delivery",
            Self::AnnouncementFlood => "announcement flood",
            Self::AnnouncementMismatch => "announcement mismatch",
            Self::BodyMismatch => "body/header mismatch",
            Self::InvalidHeader => "invalid header",
            Self::InvalidBlock => "invalid block",
            Self::ProtocolViolation => "protocol violation",
            Self::CheckpointMismatch => "checkpoint mismatch",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_reasons() {
        assert!(PenaltyReason::ProtocolViolation.is_critical());
        assert!(PenaltyReason::CheckpointMismatch.is_critical());
        assert!(!PenaltyReason::BodyMismatch.is_critical());
        assert!(!PenaltyReason::MissingResponse.is_critical());
    }

    #[test]
    fn test_disconnect_mapping() {
        assert_eq!(
            PenaltyReason::CheckpointMismatch.disconnect_reason(),
            DisconnectReason::CheckpointMismatch
        );
        assert_eq!(
            PenaltyReason::MissingResponse.disconnect_reason(),
            DisconnectReason::Unresponsive
        );
    }
}
