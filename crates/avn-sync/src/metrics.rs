//! Sync metrics.
//!
//! Counters and timers for the downloader, the fetchers and the sync
//! controller. Everything is atomic; a single `Arc<SyncMetrics>` is shared
//! by all components of a node.

use avn_network::RequestKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to 0 and return the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Latency timer tracking count, total, min and max.
#[derive(Debug)]
pub struct Timer {
    total_us: AtomicU64,
    count: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            total_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }
}

impl Timer {
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Start timing. The guard records on drop.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            timer: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total = Duration::from_micros(self.total_us.load(Ordering::Relaxed));
        let min = self.min_us.load(Ordering::Relaxed);
        TimerSnapshot {
            count,
            total,
            avg: if count == 0 {
                Duration::ZERO
            } else {
                total / count as u32
            },
            min: if min == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_micros(min)
            },
            max: Duration::from_micros(self.max_us.load(Ordering::Relaxed)),
        }
    }
}

/// Records the elapsed time into its timer when dropped.
pub struct TimerGuard<'a> {
    timer: &'a Timer,
    start: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Point-in-time copy of a timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total: Duration,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Per request kind downloader meters.
#[derive(Debug, Default)]
pub struct FetchMetrics {
    /// Items delivered and accepted.
    pub items_in: Counter,
    /// Request round trips.
    pub requests: Timer,
    /// Deliveries with no matching request, or rejected.
    pub dropped: Counter,
    /// Requests that hit their deadline.
    pub timeouts: Counter,
}

/// Downloader meters.
#[derive(Debug, Default)]
pub struct DownloaderMetrics {
    pub headers: FetchMetrics,
    pub bodies: FetchMetrics,
    pub receipts: FetchMetrics,
    pub state: FetchMetrics,
    /// Times a fetch waited for an idle peer.
    pub throttle: Counter,
    pub ops_started: Counter,
    pub ops_failed: Counter,
    pub ops_canceled: Counter,
}

impl DownloaderMetrics {
    pub fn kind(&self, kind: RequestKind) -> &FetchMetrics {
        match kind {
            RequestKind::Headers => &self.headers,
            RequestKind::Bodies => &self.bodies,
            RequestKind::Receipts => &self.receipts,
            RequestKind::State => &self.state,
        }
    }
}

/// Block fetcher meters.
#[derive(Debug, Default)]
pub struct BlockFetcherMetrics {
    pub announces_in: Counter,
    pub announces_dropped: Counter,
    pub announces_dos: Counter,
    pub broadcasts_in: Counter,
    pub broadcasts_dropped: Counter,
    pub broadcasts_dos: Counter,
    pub header_fetches: Counter,
    pub header_timeouts: Counter,
    pub body_fetches: Counter,
    pub body_timeouts: Counter,
    pub body_mismatches: Counter,
    pub imported: Counter,
    pub import_failed: Counter,
    pub discarded_fast_sync: Counter,
}

/// Transaction fetcher meters.
#[derive(Debug, Default)]
pub struct TxFetcherMetrics {
    pub announces_in: Counter,
    pub announces_known: Counter,
    pub announces_dos: Counter,
    pub requests_out: Counter,
    pub request_timeouts: Counter,
    pub replies_in: Counter,
    pub replies_known: Counter,
    pub replies_rejected: Counter,
    pub broadcasts_in: Counter,
}

/// Protocol handler meters.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    pub packets_in: Counter,
    pub peers_dropped: Counter,
    pub challenges_sent: Counter,
    pub challenges_failed: Counter,
}

/// All sync meters.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub downloader: DownloaderMetrics,
    pub block_fetcher: BlockFetcherMetrics,
    pub tx_fetcher: TxFetcherMetrics,
    pub handler: HandlerMetrics,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
