//! Transaction fetcher: retrieves announced transactions that the pool does
//! not have yet.
//!
//! Announced hashes wait `arrive_timeout` for a broadcast to deliver them.
//! After that each idle announcer gets at most one batched request for the
//! hashes it announced, and no hash is ever requested from two peers at the
//! same time. A request that times out or comes back incomplete removes the
//! peer as a source for the missing hashes.

use super::jitter;
use crate::config::TxFetcherConfig;
use crate::metrics::SyncMetrics;
use crate::{SyncError, SyncResult};
use avn_chain::{Transaction, H256};
use avn_mempool::{MempoolError, TxPool};
use avn_network::{NetworkResult, PeerId};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const COMMAND_BUFFER: usize = 256;

/// Requests pooled transactions by hash from one peer.
pub type TxRequester = Arc<dyn Fn(Vec<H256>) -> NetworkResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFetcherStats {
    /// Hashes not currently requested.
    pub waiting: usize,
    /// Hashes with a request in flight.
    pub fetching: usize,
    /// Peers with tracked announcements.
    pub peers: usize,
}

enum Command {
    Notify {
        peer: PeerId,
        hashes: Vec<H256>,
        requester: TxRequester,
    },
    Enqueue {
        peer: PeerId,
        txs: Vec<Transaction>,
        direct: bool,
    },
    Drop(PeerId),
    Stats(oneshot::Sender<TxFetcherStats>),
}

/// Handle to the transaction fetcher task.
#[derive(Clone)]
pub struct TxFetcher {
    tx: mpsc::Sender<Command>,
}

impl TxFetcher {
    pub fn new(
        config: TxFetcherConfig,
        pool: Arc<dyn TxPool>,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, TxFetcherTask) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let known = NonZeroUsize::new(config.known_cache_size).unwrap_or(NonZeroUsize::MIN);
        let task = TxFetcherTask {
            config,
            pool,
            metrics,
            rx,
            tasks: HashMap::new(),
            peers: HashMap::new(),
            known: LruCache::new(known),
        };
        (Self { tx }, task)
    }

    /// Record that `peer` announced `hashes`.
    pub async fn notify(
        &self,
        peer: &PeerId,
        hashes: Vec<H256>,
        requester: TxRequester,
    ) -> SyncResult<()> {
        self.send(Command::Notify {
            peer: peer.clone(),
            hashes,
            requester,
        })
        .await
    }

    /// Hand received transactions to the pool. `direct` marks a reply to
    /// our own request, as opposed to a broadcast.
    pub async fn enqueue(
        &self,
        peer: &PeerId,
        txs: Vec<Transaction>,
        direct: bool,
    ) -> SyncResult<()> {
        self.send(Command::Enqueue {
            peer: peer.clone(),
            txs,
            direct,
        })
        .await
    }

    /// Forget a disconnected peer.
    pub async fn drop_peer(&self, peer: &PeerId) {
        let _ = self.send(Command::Drop(peer.clone())).await;
    }

    pub async fn stats(&self) -> SyncResult<TxFetcherStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| SyncError::Stopped("tx fetcher"))
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped("tx fetcher"))
    }
}

struct TxTask {
    ready_at: Instant,
    /// Peers that announced the hash and have not failed to deliver it.
    sources: Vec<PeerId>,
    /// Peer the hash is currently requested from.
    fetching: Option<PeerId>,
}

struct Request {
    hashes: Vec<H256>,
    deadline: Instant,
}

struct PeerState {
    announced: usize,
    requester: TxRequester,
    request: Option<Request>,
}

/// State of the transaction fetcher, owned by its task.
pub struct TxFetcherTask {
    config: TxFetcherConfig,
    pool: Arc<dyn TxPool>,
    metrics: Arc<SyncMetrics>,
    rx: mpsc::Receiver<Command>,
    tasks: HashMap<H256, TxTask>,
    peers: HashMap<PeerId, PeerState>,
    known: LruCache<H256, ()>,
}

impl TxFetcherTask {
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Transaction fetcher started");
        loop {
            let wake = self.next_wake(Instant::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }
            let now = Instant::now();
            self.expire(now);
            self.schedule(now);
        }
        debug!("Transaction fetcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Notify {
                peer,
                hashes,
                requester,
            } => self.on_announce(peer, hashes, requester),
            Command::Enqueue { peer, txs, direct } => self.on_transactions(&peer, txs, direct),
            Command::Drop(peer) => self.on_drop(&peer),
            Command::Stats(reply) => {
                let fetching = self.tasks.values().filter(|t| t.fetching.is_some()).count();
                let _ = reply.send(TxFetcherStats {
                    waiting: self.tasks.len() - fetching,
                    fetching,
                    peers: self.peers.len(),
                });
            }
        }
    }

    /// Earliest future arrival timer or request deadline. Hashes that are
    /// ready but whose sources are all busy are retried when a request
    /// finishes.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let arrivals = self
            .tasks
            .values()
            .filter(|t| t.fetching.is_none() && t.ready_at > now)
            .map(|t| t.ready_at);
        let deadlines = self
            .peers
            .values()
            .filter_map(|p| p.request.as_ref().map(|r| r.deadline));
        arrivals.chain(deadlines).min()
    }

    fn on_announce(&mut self, peer: PeerId, hashes: Vec<H256>, requester: TxRequester) {
        let metrics = &self.metrics.tx_fetcher;
        metrics.announces_in.add(hashes.len() as u64);
        let ready_at = Instant::now() + self.config.arrive_timeout + jitter(self.config.gather_slack);

        let state = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState {
                announced: 0,
                requester: Arc::clone(&requester),
                request: None,
            });
        state.requester = requester;

        for hash in hashes {
            if self.pool.has(&hash) || self.known.contains(&hash) {
                metrics.announces_known.inc();
                continue;
            }
            if self
                .tasks
                .get(&hash)
                .is_some_and(|t| t.sources.contains(&peer))
            {
                continue;
            }
            if state.announced >= self.config.max_announces {
                metrics.announces_dos.inc();
                continue;
            }
            state.announced += 1;
            self.tasks
                .entry(hash)
                .or_insert_with(|| TxTask {
                    ready_at,
                    sources: Vec::new(),
                    fetching: None,
                })
                .sources
                .push(peer.clone());
        }
        trace!(peer = %peer, tracked = state.announced, "Transaction announcement");
    }

    fn on_transactions(&mut self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) {
        let metrics = &self.metrics.tx_fetcher;
        if direct {
            metrics.replies_in.add(txs.len() as u64);
        } else {
            metrics.broadcasts_in.add(txs.len() as u64);
        }

        let delivered: HashSet<H256> = txs.iter().map(Transaction::hash).collect();
        for result in self.pool.add_remotes(txs) {
            match result {
                Ok(()) => {}
                Err(MempoolError::AlreadyExists(_)) => metrics.replies_known.inc(),
                Err(err) => {
                    metrics.replies_rejected.inc();
                    trace!(peer = %peer, error = %err, "Transaction rejected by pool");
                }
            }
        }

        for hash in &delivered {
            self.known.put(*hash, ());
            if let Some(task) = self.tasks.remove(hash) {
                for source in &task.sources {
                    release(&mut self.peers, source);
                }
            }
        }

        if direct {
            let request = self.peers.get_mut(peer).and_then(|s| s.request.take());
            if let Some(request) = request {
                let missing: Vec<H256> = request
                    .hashes
                    .into_iter()
                    .filter(|h| !delivered.contains(h))
                    .collect();
                if !missing.is_empty() {
                    debug!(peer = %peer, missing = missing.len(), "Incomplete transaction reply");
                }
                self.fail(peer, &missing);
            }
        }
    }

    fn on_drop(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.tasks.retain(|_, task| {
            if task.fetching.as_ref() == Some(peer) {
                task.fetching = None;
            }
            task.sources.retain(|s| s != peer);
            !task.sources.is_empty()
        });
        trace!(peer = %peer, "Dropped transaction announcer");
    }

    /// `peer` did not deliver `hashes`: stop asking it for them.
    fn fail(&mut self, peer: &PeerId, hashes: &[H256]) {
        for hash in hashes {
            let Some(task) = self.tasks.get_mut(hash) else {
                continue;
            };
            if task.fetching.as_ref() == Some(peer) {
                task.fetching = None;
            }
            if let Some(index) = task.sources.iter().position(|s| s == peer) {
                task.sources.remove(index);
                release(&mut self.peers, peer);
            }
            if task.sources.is_empty() {
                self.tasks.remove(hash);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.request.as_ref().is_some_and(|r| r.deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for peer in expired {
            let Some(request) = self.peers.get_mut(&peer).and_then(|s| s.request.take()) else {
                continue;
            };
            self.metrics.tx_fetcher.request_timeouts.inc();
            debug!(peer = %peer, count = request.hashes.len(), "Transaction request timed out");
            self.fail(&peer, &request.hashes);
        }
    }

    /// Give every idle peer one request for the ready hashes it announced.
    fn schedule(&mut self, now: Instant) {
        let mut idle: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.request.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();

        for peer in idle {
            let mut wanted: Vec<H256> = self
                .tasks
                .iter()
                .filter(|(_, t)| t.fetching.is_none() && t.ready_at <= now && t.sources.contains(&peer))
                .map(|(hash, _)| *hash)
                .collect();
            if wanted.is_empty() {
                continue;
            }
            wanted.sort();
            wanted.truncate(self.config.max_retrievals);

            for hash in &wanted {
                if let Some(task) = self.tasks.get_mut(hash) {
                    task.fetching = Some(peer.clone());
                }
            }
            let Some(state) = self.peers.get_mut(&peer) else {
                continue;
            };
            self.metrics.tx_fetcher.requests_out.inc();
            trace!(peer = %peer, count = wanted.len(), "Requesting transactions");
            match (state.requester)(wanted.clone()) {
                Ok(()) => {
                    state.request = Some(Request {
                        hashes: wanted,
                        deadline: now + self.config.fetch_timeout,
                    });
                }
                Err(err) => {
                    debug!(peer = %peer, error = %err, "Transaction request failed");
                    self.fail(&peer, &wanted);
                }
            }
        }
    }
}

fn release(peers: &mut HashMap<PeerId, PeerState>, peer: &PeerId) {
    if let Some(state) = peers.get_mut(peer) {
        state.announced = state.announced.saturating_sub(1);
    }
}
