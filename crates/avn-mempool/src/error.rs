//! Error types for the mempool.

use thiserror::Error;

/// Mempool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// Transaction already exists in mempool.
    #[error("Transaction already in mempool: {0}")]
    AlreadyExists(String),

    /// Transaction too large.
    #[error("Transaction too large: {size} bytes, max {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// Mempool full.
    #[error("Mempool full: {count} transactions, max {max}")]
    Full { count: usize, max: usize },

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    NotFound(String),
}

/// Result type for mempool operations.
pub type MempoolResult<T> = Result<T, MempoolError>;
