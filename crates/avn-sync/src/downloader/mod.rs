//! Chain downloader.
//!
//! One synchronisation operation at a time against a chosen master peer:
//! 1. Fetch the master's advertised head header
//! 2. Locate the common ancestor (geometric probe, then binary search)
//! 3. Fetch headers as a skeleton from the master, filling the gaps from
//!    any idle peer, and commit them in order
//! 4. Fetch bodies (and receipts up to the pivot in fast mode)
//! 5. In fast mode, fetch the pivot state and promote the pivot block
//! 6. Import the remaining blocks fully

mod ancestor;
mod blocks;
mod fetch;
mod headers;
mod queue;
mod router;
mod skeleton;
mod state;

pub use headers::{HeaderBatch, HeaderQueue};
pub use queue::{FetchQueue, FetchTask, QueueStats};
pub use router::Delivery;

use crate::config::{DownloaderConfig, SyncMode};
use crate::context::OpContext;
use crate::distributor::RequestDistributor;
use crate::metrics::SyncMetrics;
use crate::{SyncError, SyncResult};
use avn_chain::{Body, ChainStore, Engine, Header, Receipt, TotalDifficulty, H256};
use avn_network::{NetworkError, PeerId, PeerSet, RequestKind};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use router::DeliveryRouter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serialises mutations of the chain store between the downloader and the
/// block fetcher.
pub type ChainLock = Arc<Mutex<()>>;

/// Lifecycle of the current (or last) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    FetchingHeaders,
    FetchingBodies,
    FetchingReceipts,
    FetchingState,
    Committing,
    Canceled,
    Failed,
}

/// Progress of the current (or last) operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
    pub pulled_states: u64,
    pub known_states: u64,
}

/// What one operation syncs towards.
#[derive(Debug, Clone)]
pub(crate) struct SyncTarget {
    pub peer: PeerId,
    pub head: H256,
    pub td: TotalDifficulty,
    pub mode: SyncMode,
}

struct ActiveOp {
    cancel: CancellationToken,
    canceled: bool,
}

/// Clears the busy flag when an operation ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Chain downloader.
pub struct Downloader {
    config: DownloaderConfig,
    chain: Arc<dyn ChainStore>,
    engine: Arc<dyn Engine>,
    peers: Arc<PeerSet>,
    distributor: RequestDistributor,
    router: DeliveryRouter,
    metrics: Arc<SyncMetrics>,
    chain_lock: ChainLock,
    synchronising: AtomicBool,
    active: Mutex<Option<ActiveOp>>,
    status: RwLock<SyncStatus>,
    progress: RwLock<SyncProgress>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        chain: Arc<dyn ChainStore>,
        engine: Arc<dyn Engine>,
        peers: Arc<PeerSet>,
        metrics: Arc<SyncMetrics>,
        chain_lock: ChainLock,
    ) -> Self {
        let distributor = RequestDistributor::new(
            Arc::clone(&peers),
            Arc::clone(&metrics),
            config.idle_wait_timeout,
            config.starvation_threshold,
        );
        Self {
            config,
            chain,
            engine,
            peers,
            distributor,
            router: DeliveryRouter::default(),
            metrics,
            chain_lock,
            synchronising: AtomicBool::new(false),
            active: Mutex::new(None),
            status: RwLock::new(SyncStatus::Idle),
            progress: RwLock::new(SyncProgress::default()),
        }
    }

    /// Synchronise with `peer` towards its advertised head.
    ///
    /// Fails with `Busy` if an operation is already running. Fast mode is
    /// downgraded to full once the local chain has any imported block.
    pub async fn synchronise(
        &self,
        peer: &PeerId,
        head: H256,
        td: TotalDifficulty,
        mode: SyncMode,
    ) -> SyncResult<()> {
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        let _busy = BusyGuard(&self.synchronising);

        let mode = if mode == SyncMode::Fast && self.chain.current_block().number > 0 {
            debug!("Local chain not empty, using full sync");
            SyncMode::Full
        } else {
            mode
        };

        let cancel = CancellationToken::new();
        *self.active.lock() = Some(ActiveOp {
            cancel: cancel.clone(),
            canceled: false,
        });
        let ctx = OpContext::with_timeout(cancel, self.config.max_sync_duration);
        let start = self.local_head(mode).number;
        *self.progress.write() = SyncProgress {
            starting_block: start,
            current_block: start,
            ..SyncProgress::default()
        };
        self.set_status(SyncStatus::FetchingHeaders);
        self.metrics.downloader.ops_started.inc();
        info!(peer = %peer, head = %head.short(), td, %mode, "Synchronisation started");

        let target = SyncTarget {
            peer: peer.clone(),
            head,
            td,
            mode,
        };
        let result = if self.peers.contains(peer) {
            self.run(&ctx, &target).await
        } else {
            Err(SyncError::Network(NetworkError::UnknownPeer(peer.clone())))
        };

        let canceled = self.active.lock().take().is_some_and(|op| op.canceled);
        let result = if canceled { Err(SyncError::Canceled) } else { result };

        match &result {
            Ok(()) => {
                self.set_status(SyncStatus::Idle);
                let progress = self.progress();
                info!(
                    peer = %peer,
                    from = progress.starting_block,
                    to = progress.current_block,
                    "Synchronisation completed"
                );
            }
            Err(SyncError::Canceled) => {
                self.set_status(SyncStatus::Canceled);
                info!(peer = %peer, "Synchronisation canceled");
            }
            Err(err) => {
                self.set_status(SyncStatus::Failed);
                self.metrics.downloader.ops_failed.inc();
                warn!(peer = %peer, error = %err, "Synchronisation failed");
                if let Some((bad, reason)) = err.peer_fault() {
                    self.peers.drop_peer(bad, reason);
                }
            }
        }
        result
    }

    /// Cancel the running operation. Idempotent; a no-op when idle.
    pub fn cancel(&self) {
        let mut active = self.active.lock();
        if let Some(op) = active.as_mut() {
            if !op.canceled {
                op.canceled = true;
                op.cancel.cancel();
                self.metrics.downloader.ops_canceled.inc();
                debug!("Synchronisation cancel requested");
            }
        }
    }

    pub fn is_synchronising(&self) -> bool {
        self.synchronising.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.read()
    }

    pub fn progress(&self) -> SyncProgress {
        *self.progress.read()
    }

    // ----- deliveries from the protocol handler -----

    pub fn deliver_headers(&self, peer: &PeerId, headers: Vec<Header>) -> SyncResult<()> {
        self.deliver(peer, Delivery::Headers(headers))
    }

    pub fn deliver_bodies(&self, peer: &PeerId, bodies: Vec<Body>) -> SyncResult<()> {
        self.deliver(peer, Delivery::Bodies(bodies))
    }

    pub fn deliver_receipts(&self, peer: &PeerId, receipts: Vec<Vec<Receipt>>) -> SyncResult<()> {
        self.deliver(peer, Delivery::Receipts(receipts))
    }

    pub fn deliver_node_data(&self, peer: &PeerId, data: Vec<Bytes>) -> SyncResult<()> {
        self.deliver(peer, Delivery::NodeData(data))
    }

    /// Whether a reply of `kind` from `peer` is awaited.
    pub fn is_expecting(&self, peer: &PeerId, kind: RequestKind) -> bool {
        self.router.is_expecting(peer, kind)
    }

    fn deliver(&self, peer: &PeerId, delivery: Delivery) -> SyncResult<()> {
        let kind = delivery.kind();
        let items = delivery.len() as u64;
        let metrics = self.metrics.downloader.kind(kind);
        match self.router.deliver(peer, delivery) {
            Ok(()) => {
                metrics.items_in.add(items);
                Ok(())
            }
            Err(_) => {
                metrics.dropped.add(items.max(1));
                Err(SyncError::NoPendingRequest {
                    peer: peer.clone(),
                    kind,
                })
            }
        }
    }

    // ----- operation -----

    async fn run(&self, ctx: &OpContext, target: &SyncTarget) -> SyncResult<()> {
        let remote = self.fetch_head(ctx, target).await?;
        let ancestor = self.find_ancestor(ctx, target, &remote).await?;
        let origin = ancestor.number;
        {
            let mut progress = self.progress.write();
            progress.starting_block = origin;
            progress.current_block = origin;
            progress.highest_block = remote.number;
        }

        if remote.number <= origin {
            let local_td = self.chain.total_difficulty(&remote.hash()).unwrap_or(0);
            if local_td < target.td {
                return Err(SyncError::invalid_chain(
                    &target.peer,
                    format!("advertised TD {} above head TD {local_td}", target.td),
                ));
            }
            debug!(peer = %target.peer, "Already synced with peer");
            return Ok(());
        }

        let pivot = match target.mode {
            SyncMode::Fast => Some(
                remote
                    .number
                    .saturating_sub(self.config.min_full_blocks)
                    .max(origin + 1),
            ),
            SyncMode::Full => None,
        };
        debug!(origin, head = remote.number, ?pivot, "Common ancestor located");

        if let Err(err) = self.fetch_headers(ctx, target, &ancestor, &remote).await {
            if target.mode == SyncMode::Fast
                && matches!(
                    err,
                    SyncError::InvalidHeaderChain { .. } | SyncError::HeaderGap { .. }
                )
            {
                self.rollback(origin);
            }
            return Err(err);
        }

        let hashes = self.collect_chain(&remote, origin)?;
        self.fetch_blocks(ctx, target, &hashes, pivot).await
    }

    /// Discard unverified headers above `number` after a failed fast sync.
    fn rollback(&self, number: u64) {
        let _guard = self.chain_lock.lock();
        let head = self.chain.current_header().number;
        match self.chain.set_head(number) {
            Ok(()) => warn!(from = head, to = number, "Rolled back header chain"),
            Err(err) => warn!(error = %err, "Header rollback failed"),
        }
    }

    /// Hashes of the committed remote chain above `origin`, ascending.
    fn collect_chain(&self, remote: &Header, origin: u64) -> SyncResult<Vec<H256>> {
        let mut hashes = Vec::with_capacity((remote.number - origin) as usize);
        let mut hash = remote.hash();
        let mut number = remote.number;
        while number > origin {
            let header = self
                .chain
                .header_by_hash(&hash)
                .ok_or(avn_chain::ChainError::UnknownHeader(hash))?;
            hashes.push(hash);
            hash = header.parent_hash;
            number = header.number - 1;
        }
        hashes.reverse();
        Ok(hashes)
    }

    fn local_head(&self, mode: SyncMode) -> Header {
        match mode {
            SyncMode::Full => self.chain.current_block(),
            SyncMode::Fast => self.chain.current_fast_block(),
        }
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.write() = status;
    }
}
