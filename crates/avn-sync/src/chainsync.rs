//! Chain sync controller.
//!
//! Decides when to run the downloader and against whom. Peer head changes
//! arrive as events; whenever no operation is running the best known peer
//! is compared against the local chain and, if it is ahead, a sync
//! operation is spawned. Candidates appearing while an operation runs are
//! picked up as soon as it finishes.

use crate::config::{ChainSyncConfig, SyncMode};
use crate::downloader::Downloader;
use crate::flags::SyncFlags;
use crate::{SyncError, SyncResult};
use avn_chain::{ChainStore, TotalDifficulty};
use avn_network::{Peer, PeerId, PeerSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const EVENT_BUFFER: usize = 100;

/// The downloader operation currently running.
struct RunningOp {
    peer: PeerId,
    mode: SyncMode,
    task: JoinHandle<SyncResult<()>>,
}

/// Resolves when the running operation ends, including by panic.
async fn join_op(op: &mut Option<RunningOp>) -> Result<SyncResult<()>, JoinError> {
    match op {
        Some(op) => (&mut op.task).await,
        None => std::future::pending().await,
    }
}

/// Sends peer events to the chain syncer.
#[derive(Clone)]
pub struct ChainSyncHandle {
    tx: mpsc::Sender<PeerId>,
}

impl ChainSyncHandle {
    /// A peer connected, disconnected or changed its head.
    pub async fn peer_event(&self, peer: &PeerId) {
        if self.tx.send(peer.clone()).await.is_err() {
            trace!(peer = %peer, "Chain syncer stopped, event ignored");
        }
    }
}

/// The chain sync controller task.
pub struct ChainSyncer {
    config: ChainSyncConfig,
    chain: Arc<dyn ChainStore>,
    peers: Arc<PeerSet>,
    downloader: Arc<Downloader>,
    flags: Arc<SyncFlags>,
    events: mpsc::Receiver<PeerId>,
    running: Option<RunningOp>,
    last_attempt: HashMap<PeerId, Instant>,
    force_at: Instant,
    forced: bool,
    retry_at: Option<Instant>,
}

impl ChainSyncer {
    pub fn new(
        config: ChainSyncConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<PeerSet>,
        downloader: Arc<Downloader>,
        flags: Arc<SyncFlags>,
    ) -> (Self, ChainSyncHandle) {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let force_at = Instant::now() + config.force_sync_interval;
        let syncer = Self {
            config,
            chain,
            peers,
            downloader,
            flags,
            events,
            running: None,
            last_attempt: HashMap::new(),
            force_at,
            forced: false,
            retry_at: None,
        };
        (syncer, ChainSyncHandle { tx })
    }

    /// Run until shutdown. A running operation is canceled and awaited
    /// before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(min_peers = self.config.min_peers, "Chain syncer started");
        loop {
            let now = Instant::now();
            if !self.forced && now >= self.force_at {
                self.forced = true;
                trace!("Sync force timer fired");
            }
            if self.running.is_none() {
                self.maybe_start(now);
            }

            let wake = self.next_wake();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(peer) => trace!(peer = %peer, "Chain sync event"),
                    None => break,
                },
                joined = join_op(&mut self.running), if self.running.is_some() => {
                    if let Some(op) = self.running.take() {
                        let result = joined.unwrap_or_else(|e| {
                            Err(SyncError::Stalled(format!("sync operation aborted: {e}")))
                        });
                        self.finish(op.peer, op.mode, result);
                    }
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }
        }

        if let Some(op) = self.running.take() {
            self.downloader.cancel();
            let _ = op.task.await;
        }
        debug!("Chain syncer stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        let force = (!self.forced).then_some(self.force_at);
        [force, self.retry_at].into_iter().flatten().min()
    }

    fn local_td(&self, mode: SyncMode) -> TotalDifficulty {
        let head = match mode {
            SyncMode::Fast => self.chain.current_fast_block(),
            SyncMode::Full => self.chain.current_block(),
        };
        self.chain.total_difficulty(&head.hash()).unwrap_or_default()
    }

    /// The peer and mode of the next operation, if one is due.
    fn next_op(&mut self, now: Instant) -> Option<(Arc<Peer>, SyncMode)> {
        if self.peers.len() < self.config.min_peers && !self.forced {
            return None;
        }
        let peer = self.peers.peer_with_highest_td()?;
        let mode = if self.flags.is_fast_sync() {
            SyncMode::Fast
        } else {
            SyncMode::Full
        };
        let local_td = self.local_td(mode);
        if peer.td() <= local_td.saturating_add(self.config.td_margin) {
            return None;
        }
        if let Some(last) = self.last_attempt.get(peer.id()) {
            let ready = *last + self.config.min_attempt_interval;
            if now < ready {
                self.retry_at = Some(ready);
                return None;
            }
        }
        Some((peer, mode))
    }

    fn maybe_start(&mut self, now: Instant) {
        self.retry_at = None;
        let interval = self.config.min_attempt_interval;
        self.last_attempt.retain(|_, at| now < *at + interval);

        let Some((peer, mode)) = self.next_op(now) else {
            return;
        };
        let id = peer.id().clone();
        let head = peer.head();
        self.last_attempt.insert(id.clone(), now);
        info!(peer = %id, td = head.td, %mode, "Starting chain sync");

        let downloader = Arc::clone(&self.downloader);
        let peer = id.clone();
        let task = tokio::spawn(async move {
            downloader.synchronise(&peer, head.hash, head.td, mode).await
        });
        self.running = Some(RunningOp {
            peer: id,
            mode,
            task,
        });
    }

    fn finish(&mut self, peer: PeerId, mode: SyncMode, result: SyncResult<()>) {
        self.running = None;
        self.forced = false;
        self.force_at = Instant::now() + self.config.force_sync_interval;

        match result {
            Ok(()) => {
                if mode == SyncMode::Fast && self.flags.is_fast_sync() {
                    self.flags.set_fast_sync(false);
                    info!("Fast sync complete, switching to full sync");
                }
                if self.flags.enable_txs() {
                    info!("Enabled transaction acceptance");
                }
                debug!(peer = %peer, head = self.chain.current_block().number, "Chain sync finished");
            }
            Err(err) => debug!(peer = %peer, error = %err, "Chain sync attempt failed"),
        }
    }
}
