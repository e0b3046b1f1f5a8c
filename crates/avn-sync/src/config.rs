//! Sync configuration.

use crate::{
    BLOCK_CHUNK_SIZE, MAX_BODY_FETCH, MAX_FORK_ANCESTRY, MAX_HEADER_FETCH, MAX_RECEIPT_FETCH,
    MAX_SKELETON_SIZE, MAX_STATE_FETCH, MIN_FULL_BLOCKS, PARALLEL_REQUESTS,
};
use avn_chain::H256;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the downloader reconstructs the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Import every block with full execution.
    #[default]
    Full,
    /// Download receipts up to a pivot, fetch the pivot state, then import
    /// the remainder fully.
    Fast,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Fast => f.write_str("fast"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "fast" => Ok(Self::Fast),
            other => Err(format!("unknown sync mode: {other}")),
        }
    }
}

/// A trusted block every peer must agree on during fast sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub number: u64,
    pub hash: H256,
}

/// Downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Headers per skeleton gap and dense request.
    pub max_header_fetch: u64,
    /// Skeleton anchors per request.
    pub max_skeleton_size: u64,
    /// Bodies per request.
    pub max_body_fetch: usize,
    /// Receipt lists per request.
    pub max_receipt_fetch: usize,
    /// State entries per request.
    pub max_state_fetch: usize,
    /// Blocks fetched and committed per round.
    pub block_chunk_size: u64,
    /// How far below the local head a common ancestor may be.
    pub max_fork_ancestry: u64,
    /// Blocks below the remote head that are fully imported in fast sync.
    pub min_full_blocks: u64,
    /// Headers probed per round of the ancestor search.
    pub ancestor_probe_count: u64,
    /// Growth factor of the probe stride between rounds.
    pub ancestor_probe_growth: u64,
    /// Concurrent fetch workers per phase.
    pub parallel_requests: usize,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Round trip a request is sized for.
    pub target_rtt: Duration,
    /// How long to wait for an idle peer before giving up.
    pub idle_wait_timeout: Duration,
    /// Idle time after which a peer is preferred regardless of throughput.
    pub starvation_threshold: Duration,
    /// Deadline of a whole sync operation.
    pub max_sync_duration: Duration,
    /// Attempts per item before the operation fails.
    pub max_retries: u32,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_header_fetch: MAX_HEADER_FETCH,
            max_skeleton_size: MAX_SKELETON_SIZE,
            max_body_fetch: MAX_BODY_FETCH,
            max_receipt_fetch: MAX_RECEIPT_FETCH,
            max_state_fetch: MAX_STATE_FETCH,
            block_chunk_size: BLOCK_CHUNK_SIZE,
            max_fork_ancestry: MAX_FORK_ANCESTRY,
            min_full_blocks: MIN_FULL_BLOCKS,
            ancestor_probe_count: 8,
            ancestor_probe_growth: 16,
            parallel_requests: PARALLEL_REQUESTS,
            request_timeout: Duration::from_secs(10),
            target_rtt: Duration::from_secs(2),
            idle_wait_timeout: Duration::from_secs(30),
            starvation_threshold: Duration::from_secs(5),
            max_sync_duration: Duration::from_secs(6 * 60 * 60),
            max_retries: 5,
        }
    }
}

/// Block fetcher configuration.
#[derive(Debug, Clone)]
pub struct BlockFetcherConfig {
    /// Delay before an announced block is explicitly fetched.
    pub arrive_timeout: Duration,
    /// Random spread added to the arrival delay.
    pub gather_slack: Duration,
    /// Deadline of a header or body request.
    pub fetch_timeout: Duration,
    /// Blocks this far behind the head are dropped.
    pub max_uncle_dist: u64,
    /// Blocks this far ahead of the head are dropped.
    pub max_queue_dist: u64,
    /// Outstanding announcements per peer.
    pub hash_limit: usize,
    /// Queued blocks per peer.
    pub block_limit: usize,
    /// Recently imported hashes remembered.
    pub known_cache_size: usize,
}

impl Default for BlockFetcherConfig {
    fn default() -> Self {
        Self {
            arrive_timeout: Duration::from_millis(500),
            gather_slack: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(5),
            max_uncle_dist: 7,
            max_queue_dist: 32,
            hash_limit: 256,
            block_limit: 64,
            known_cache_size: 1024,
        }
    }
}

/// Transaction fetcher configuration.
#[derive(Debug, Clone)]
pub struct TxFetcherConfig {
    /// Delay before an announced transaction is requested.
    pub arrive_timeout: Duration,
    /// Random spread added to the arrival delay.
    pub gather_slack: Duration,
    /// Deadline of a retrieval.
    pub fetch_timeout: Duration,
    /// Tracked announcements per peer.
    pub max_announces: usize,
    /// Hashes per retrieval.
    pub max_retrievals: usize,
    /// Recently delivered hashes remembered.
    pub known_cache_size: usize,
}

impl Default for TxFetcherConfig {
    fn default() -> Self {
        Self {
            arrive_timeout: Duration::from_millis(500),
            gather_slack: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(5),
            max_announces: 4096,
            max_retrievals: 256,
            known_cache_size: 32_768,
        }
    }
}

/// Chain sync controller configuration.
#[derive(Debug, Clone)]
pub struct ChainSyncConfig {
    /// Peers required before syncing starts, until the force timer fires.
    pub min_peers: usize,
    /// Time after which sync starts with any number of peers.
    pub force_sync_interval: Duration,
    /// Minimum spacing of attempts against the same peer.
    pub min_attempt_interval: Duration,
    /// Required TD lead of a peer over the local chain.
    pub td_margin: u128,
}

impl Default for ChainSyncConfig {
    fn default() -> Self {
        Self {
            min_peers: 5,
            force_sync_interval: Duration::from_secs(10),
            min_attempt_interval: Duration::from_secs(10),
            td_margin: 0,
        }
    }
}

/// Protocol handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Checkpoint every peer is challenged with during fast sync.
    pub checkpoint: Option<Checkpoint>,
    /// Blocks every peer must agree on, by number.
    pub whitelist: HashMap<u64, H256>,
    /// Deadline of the checkpoint challenge.
    pub challenge_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            whitelist: HashMap::new(),
            challenge_timeout: Duration::from_secs(15),
        }
    }
}

/// Combined sync configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Requested mode. Fast sync only applies to an empty chain.
    pub mode: SyncMode,
    pub downloader: DownloaderConfig,
    pub block_fetcher: BlockFetcherConfig,
    pub tx_fetcher: TxFetcherConfig,
    pub chain_sync: ChainSyncConfig,
    pub handler: HandlerConfig,
}
