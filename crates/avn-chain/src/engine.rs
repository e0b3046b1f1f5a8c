//! Header verification.

use crate::types::Header;
use crate::{ConsensusError, ConsensusResult};

/// Maximum extra-data length accepted by [`BasicEngine`].
pub const MAX_EXTRA_SIZE: usize = 32;

/// Verifies a header against its parent.
///
/// Consensus rules live behind this trait; the sync core only needs to know
/// whether a header is acceptable.
pub trait Engine: Send + Sync {
    fn verify_header(&self, header: &Header, parent: &Header) -> ConsensusResult<()>;
}

/// Structural checks only: linkage, monotonic number/time, non-zero
/// difficulty and bounded extra data.
#[derive(Debug, Clone, Default)]
pub struct BasicEngine;

impl Engine for BasicEngine {
    fn verify_header(&self, header: &Header, parent: &Header) -> ConsensusResult<()> {
        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber {
                expected: parent.number + 1,
                got: header.number,
            });
        }
        if header.parent_hash != parent.hash() {
            return Err(ConsensusError::ParentMismatch {
                number: header.number,
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(ConsensusError::InvalidTimestamp {
                timestamp: header.timestamp,
                parent: parent.timestamp,
            });
        }
        if header.difficulty == 0 {
            return Err(ConsensusError::ZeroDifficulty(header.number));
        }
        if header.extra.len() > MAX_EXTRA_SIZE {
            return Err(ConsensusError::ExtraTooLong {
                size: header.extra.len(),
                max: MAX_EXTRA_SIZE,
            });
        }
        Ok(())
    }
}
