//! # avn-mempool
//!
//! Pool of remote transactions waiting for inclusion.
//!
//! This crate provides:
//! - The `TxPool` interface the transaction fetcher deduplicates against
//! - A concurrent `Mempool` with count and size limits

mod error;
mod pool;

pub use error::{MempoolError, MempoolResult};
pub use pool::{Mempool, MempoolConfig, MempoolStats, PooledTransaction, TxPool};

/// Default maximum number of transactions.
pub const DEFAULT_MAX_TXS: usize = 10_000;

/// Default maximum encoded transaction size.
pub const DEFAULT_MAX_TX_SIZE: usize = 128 * 1024;
