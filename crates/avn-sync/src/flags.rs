//! Node-wide sync switches shared by the controller, fetchers and handler.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether fast sync is still enabled and whether transactions are accepted
/// from the network.
#[derive(Debug, Default)]
pub struct SyncFlags {
    fast_sync: AtomicBool,
    accept_txs: AtomicBool,
}

impl SyncFlags {
    pub fn new(fast_sync: bool) -> Self {
        Self {
            fast_sync: AtomicBool::new(fast_sync),
            accept_txs: AtomicBool::new(false),
        }
    }

    pub fn is_fast_sync(&self) -> bool {
        self.fast_sync.load(Ordering::Acquire)
    }

    pub fn set_fast_sync(&self, enabled: bool) {
        self.fast_sync.store(enabled, Ordering::Release);
    }

    pub fn accepts_txs(&self) -> bool {
        self.accept_txs.load(Ordering::Acquire)
    }

    /// Enable transaction acceptance. Returns `true` if it was off.
    pub fn enable_txs(&self) -> bool {
        !self.accept_txs.swap(true, Ordering::AcqRel)
    }
}
