//! # avn-sync
//!
//! Chain synchronisation for avalanria nodes.
//!
//! This crate provides:
//! - Request distribution over idle peers with throughput-based sizing
//! - Full and fast (pivot state) chain download against a master peer
//! - Block and transaction fetchers driven by announcements
//! - The chain sync controller deciding when and with whom to sync
//! - The per-connection protocol handler routing inbound packets

mod chainsync;
mod config;
mod context;
mod distributor;
mod downloader;
mod error;
mod fetcher;
mod flags;
mod handler;
mod metrics;
mod service;

#[cfg(test)]
mod test_support;

pub use chainsync::{ChainSyncHandle, ChainSyncer};
pub use config::{
    BlockFetcherConfig, ChainSyncConfig, Checkpoint, DownloaderConfig, HandlerConfig,
    SyncConfig, SyncMode, TxFetcherConfig,
};
pub use context::OpContext;
pub use distributor::{FetchRequest, RequestDistributor, Reservation};
pub use downloader::{
    ChainLock, Delivery, Downloader, FetchQueue, FetchTask, HeaderBatch, HeaderQueue,
    QueueStats, SyncProgress, SyncStatus,
};
pub use error::{SyncError, SyncResult};
pub use fetcher::{
    BlockAnnounce, BlockFetcher, BlockFetcherStats, BlockFetcherTask, BodyRequester,
    HeaderRequester, TxFetcher, TxFetcherStats, TxFetcherTask, TxRequester,
};
pub use flags::SyncFlags;
pub use handler::Handler;
pub use metrics::{
    BlockFetcherMetrics, Counter, DownloaderMetrics, FetchMetrics, HandlerMetrics, SyncMetrics,
    Timer, TimerSnapshot, TxFetcherMetrics,
};
pub use service::SyncService;

/// Headers per skeleton gap and per dense header request.
pub const MAX_HEADER_FETCH: u64 = 192;

/// Skeleton anchors requested at once.
pub const MAX_SKELETON_SIZE: u64 = 128;

/// Bodies per request.
pub const MAX_BODY_FETCH: usize = 128;

/// Receipt lists per request.
pub const MAX_RECEIPT_FETCH: usize = 256;

/// State entries per request.
pub const MAX_STATE_FETCH: usize = 384;

/// Blocks fetched and committed per round.
pub const BLOCK_CHUNK_SIZE: u64 = 2048;

/// Deepest reorg the ancestor search accepts below the local head.
pub const MAX_FORK_ANCESTRY: u64 = 90_000;

/// Blocks below the remote head imported fully during fast sync.
pub const MIN_FULL_BLOCKS: u64 = 64;

/// Concurrent fetch workers per phase.
pub const PARALLEL_REQUESTS: usize = 16;
