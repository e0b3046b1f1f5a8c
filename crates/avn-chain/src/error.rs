//! Chain store and header verification errors.

use crate::hash::H256;
use thiserror::Error;

/// Chain store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Parent of an inserted item is not known.
    #[error("Unknown parent {parent} of block {number}")]
    UnknownParent { number: u64, parent: H256 },

    /// Inserted batch is not a contiguous linked chain.
    #[error("Non-contiguous insert at block {number}")]
    NonContiguous { number: u64 },

    /// Total difficulty does not fit the counter.
    #[error("Total difficulty overflow at block {number}")]
    DifficultyOverflow { number: u64 },

    /// Header for a body or receipt insert is missing.
    #[error("Unknown header: {0}")]
    UnknownHeader(H256),

    /// Body does not match its header commitments.
    #[error("Body of block {number} does not match header roots")]
    BodyMismatch { number: u64 },

    /// Receipts do not match the header commitment.
    #[error("Receipts of block {number} do not match header root")]
    ReceiptMismatch { number: u64 },

    /// State required for a full import is missing.
    #[error("Missing state for block {number} (root {root})")]
    MissingState { number: u64, root: H256 },

    /// Malformed state trie entry.
    #[error("Invalid state node: {0}")]
    InvalidStateNode(String),

    /// Header rejected by the verifier.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Header verification errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Number is not parent + 1.
    #[error("Invalid number: expected {expected}, got {got}")]
    InvalidNumber { expected: u64, got: u64 },

    /// Parent hash does not link to the parent.
    #[error("Parent hash mismatch at block {number}")]
    ParentMismatch { number: u64 },

    /// Timestamp not after the parent's.
    #[error("Timestamp {timestamp} not after parent timestamp {parent}")]
    InvalidTimestamp { timestamp: u64, parent: u64 },

    /// Zero difficulty would leave total difficulty flat.
    #[error("Zero difficulty at block {0}")]
    ZeroDifficulty(u64),

    /// Extra data too long.
    #[error("Extra data too long: {size} bytes, max {max} bytes")]
    ExtraTooLong { size: usize, max: usize },
}

/// Result type for chain store operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for verification.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
