//! Transaction pool implementation.

use crate::{MempoolError, MempoolResult, DEFAULT_MAX_TXS, DEFAULT_MAX_TX_SIZE};
use avn_chain::{Transaction, H256};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

/// The pool surface used by the transaction fetcher.
pub trait TxPool: Send + Sync {
    /// Whether the pool already holds this transaction.
    fn has(&self, hash: &H256) -> bool;

    /// Add transactions received from the network, one result per input.
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<MempoolResult<()>>;
}

/// Mempool configuration.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of transactions.
    pub max_transactions: usize,
    /// Maximum size of a single transaction.
    pub max_tx_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: DEFAULT_MAX_TXS,
            max_tx_size: DEFAULT_MAX_TX_SIZE,
        }
    }
}

/// Stored transaction in the mempool.
#[derive(Debug, Clone)]
pub struct PooledTransaction {
    pub tx: Transaction,
    pub arrival: Instant,
}

/// Mempool statistics.
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_size: usize,
}

/// Concurrent transaction pool.
pub struct Mempool {
    config: MempoolConfig,
    txs: DashMap<H256, PooledTransaction>,
    /// Serialises the capacity check with the insert.
    admit: Mutex<()>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            txs: DashMap::new(),
            admit: Mutex::new(()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    /// Add a single transaction.
    pub fn add(&self, tx: Transaction) -> MempoolResult<()> {
        let hash = tx.hash();
        let size = tx.size();
        if size > self.config.max_tx_size {
            return Err(MempoolError::TooLarge {
                size,
                max: self.config.max_tx_size,
            });
        }

        let _guard = self.admit.lock();
        if self.txs.contains_key(&hash) {
            return Err(MempoolError::AlreadyExists(hash.to_string()));
        }
        let count = self.txs.len();
        if count >= self.config.max_transactions {
            warn!(count, "Mempool full, rejecting transaction");
            return Err(MempoolError::Full {
                count,
                max: self.config.max_transactions,
            });
        }
        self.txs.insert(
            hash,
            PooledTransaction {
                tx,
                arrival: Instant::now(),
            },
        );
        debug!(tx = %hash.short(), size, "Transaction added to mempool");
        Ok(())
    }

    pub fn get(&self, hash: &H256) -> Option<Transaction> {
        self.txs.get(hash).map(|p| p.tx.clone())
    }

    pub fn remove(&self, hash: &H256) -> MempoolResult<Transaction> {
        self.txs
            .remove(hash)
            .map(|(_, p)| p.tx)
            .ok_or_else(|| MempoolError::NotFound(hash.to_string()))
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.txs.len(),
            total_size: self.txs.iter().map(|p| p.tx.size()).sum(),
        }
    }
}

impl TxPool for Mempool {
    fn has(&self, hash: &H256) -> bool {
        self.txs.contains_key(hash)
    }

    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<MempoolResult<()>> {
        txs.into_iter().map(|tx| self.add(tx)).collect()
    }
}
