//! Cancellation and deadline scope of a sync operation.

use crate::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Carries the cancellation token and overall deadline of one operation.
/// Every suspension point of the operation goes through [`OpContext::run`].
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl OpContext {
    pub fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }

    pub fn with_timeout(cancel: CancellationToken, timeout: Duration) -> Self {
        Self::new(cancel, Instant::now() + timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Fail fast if canceled or past the deadline.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_canceled() {
            return Err(SyncError::Canceled);
        }
        if Instant::now() >= self.deadline {
            return Err(SyncError::Timeout);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the operation is canceled or the
    /// deadline passes. Cancellation wins ties.
    pub async fn run<F: Future>(&self, fut: F) -> SyncResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Canceled),
            _ = sleep_until(self.deadline) => Err(SyncError::Timeout),
            out = fut => Ok(out),
        }
    }
}
