//! Block fetcher: turns block announcements and propagated blocks into
//! imports.
//!
//! An announced hash waits `arrive_timeout` (plus jitter) so that the block
//! itself or more announcers can show up, then its header is requested from
//! one announcer. Headers with empty bodies complete at once, the rest get
//! their bodies requested from the same peer. Complete blocks are imported
//! in number order once their parent is the local head.

use super::jitter;
use crate::config::BlockFetcherConfig;
use crate::downloader::ChainLock;
use crate::flags::SyncFlags;
use crate::metrics::SyncMetrics;
use crate::{SyncError, SyncResult};
use avn_chain::{Block, Body, ChainStore, Engine, Header, H256};
use avn_network::{DisconnectReason, NetworkResult, PeerId, PeerSet, PenaltyReason};
use lru::LruCache;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const COMMAND_BUFFER: usize = 256;

/// Requests a single header by hash from the announcing peer.
pub type HeaderRequester = Arc<dyn Fn(H256) -> NetworkResult<()> + Send + Sync>;

/// Requests bodies by hash from the announcing peer.
pub type BodyRequester = Arc<dyn Fn(Vec<H256>) -> NetworkResult<()> + Send + Sync>;

/// A block hash announced by a peer, with the means to fetch it from that
/// peer.
#[derive(Clone)]
pub struct BlockAnnounce {
    pub peer: PeerId,
    pub hash: H256,
    pub number: u64,
    pub time: Instant,
    pub fetch_header: HeaderRequester,
    pub fetch_bodies: BodyRequester,
}

impl fmt::Debug for BlockAnnounce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAnnounce")
            .field("peer", &self.peer)
            .field("hash", &self.hash)
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

/// Sizes of the fetcher's internal stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFetcherStats {
    /// Hashes waiting for their arrival timer.
    pub announced: usize,
    /// Hashes with a header request in flight.
    pub fetching: usize,
    /// Hashes with a body request in flight.
    pub completing: usize,
    /// Complete blocks waiting for import.
    pub queued: usize,
}

enum Command {
    Notify(BlockAnnounce),
    Enqueue {
        peer: PeerId,
        block: Block,
    },
    FilterHeaders {
        peer: PeerId,
        headers: Vec<Header>,
        time: Instant,
        reply: oneshot::Sender<Vec<Header>>,
    },
    FilterBodies {
        peer: PeerId,
        bodies: Vec<Body>,
        time: Instant,
        downloader_expecting: bool,
        reply: oneshot::Sender<Vec<Body>>,
    },
    ForgetPeer(PeerId),
    Stats(oneshot::Sender<BlockFetcherStats>),
}

/// Handle to the block fetcher task.
#[derive(Clone)]
pub struct BlockFetcher {
    tx: mpsc::Sender<Command>,
}

impl BlockFetcher {
    /// Create the handle and the task that must be spawned to drive it.
    pub fn new(
        config: BlockFetcherConfig,
        chain: Arc<dyn ChainStore>,
        engine: Arc<dyn Engine>,
        peers: Arc<PeerSet>,
        metrics: Arc<SyncMetrics>,
        chain_lock: ChainLock,
        flags: Arc<SyncFlags>,
    ) -> (Self, BlockFetcherTask) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let imported = NonZeroUsize::new(config.known_cache_size).unwrap_or(NonZeroUsize::MIN);
        let task = BlockFetcherTask {
            config,
            chain,
            engine,
            peers,
            metrics,
            chain_lock,
            flags,
            rx,
            announced: HashMap::new(),
            fetching: HashMap::new(),
            completing: HashMap::new(),
            announce_counts: HashMap::new(),
            queue: BinaryHeap::new(),
            queued: HashMap::new(),
            queued_counts: HashMap::new(),
            imported: LruCache::new(imported),
        };
        (Self { tx }, task)
    }

    /// Announce that `announce.peer` has the block `announce.hash`.
    pub async fn notify(&self, announce: BlockAnnounce) -> SyncResult<()> {
        self.send(Command::Notify(announce)).await
    }

    /// Queue a propagated block for import.
    pub async fn enqueue(&self, peer: &PeerId, block: Block) -> SyncResult<()> {
        self.send(Command::Enqueue {
            peer: peer.clone(),
            block,
        })
        .await
    }

    /// Consume headers answering the fetcher's own requests. Returns the
    /// headers it had not asked for.
    pub async fn filter_headers(
        &self,
        peer: &PeerId,
        headers: Vec<Header>,
        time: Instant,
    ) -> Vec<Header> {
        let (reply, rx) = oneshot::channel();
        let command = Command::FilterHeaders {
            peer: peer.clone(),
            headers,
            time,
            reply,
        };
        if let Err(mpsc::error::SendError(Command::FilterHeaders { headers, .. })) =
            self.tx.send(command).await
        {
            return headers;
        }
        rx.await.unwrap_or_default()
    }

    /// Consume bodies answering the fetcher's own requests. Returns the
    /// bodies it had not asked for.
    ///
    /// When the downloader is not waiting for bodies from `peer`, bodies
    /// matching none of the fetcher's pending headers are treated as a bad
    /// reply.
    pub async fn filter_bodies(
        &self,
        peer: &PeerId,
        bodies: Vec<Body>,
        time: Instant,
        downloader_expecting: bool,
    ) -> Vec<Body> {
        let (reply, rx) = oneshot::channel();
        let command = Command::FilterBodies {
            peer: peer.clone(),
            bodies,
            time,
            downloader_expecting,
            reply,
        };
        if let Err(mpsc::error::SendError(Command::FilterBodies { bodies, .. })) =
            self.tx.send(command).await
        {
            return bodies;
        }
        rx.await.unwrap_or_default()
    }

    /// Discard everything announced by `peer`.
    pub async fn forget_peer(&self, peer: &PeerId) {
        let _ = self.send(Command::ForgetPeer(peer.clone())).await;
    }

    pub async fn stats(&self) -> SyncResult<BlockFetcherStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| SyncError::Stopped("block fetcher"))
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped("block fetcher"))
    }
}

struct Waiting {
    ready_at: Instant,
    announces: Vec<BlockAnnounce>,
}

struct Fetching {
    announce: BlockAnnounce,
    alternates: Vec<BlockAnnounce>,
    deadline: Instant,
}

struct Completing {
    announce: BlockAnnounce,
    alternates: Vec<BlockAnnounce>,
    header: Header,
    deadline: Instant,
}

struct Queued {
    peer: PeerId,
    block: Block,
}

/// State of the block fetcher, owned by its task.
pub struct BlockFetcherTask {
    config: BlockFetcherConfig,
    chain: Arc<dyn ChainStore>,
    engine: Arc<dyn Engine>,
    peers: Arc<PeerSet>,
    metrics: Arc<SyncMetrics>,
    chain_lock: ChainLock,
    flags: Arc<SyncFlags>,
    rx: mpsc::Receiver<Command>,
    announced: HashMap<H256, Waiting>,
    fetching: HashMap<H256, Fetching>,
    completing: HashMap<H256, Completing>,
    /// Tracked announcements per peer.
    announce_counts: HashMap<PeerId, usize>,
    queue: BinaryHeap<Reverse<(u64, H256)>>,
    queued: HashMap<H256, Queued>,
    queued_counts: HashMap<PeerId, usize>,
    imported: LruCache<H256, ()>,
}

impl BlockFetcherTask {
    /// Process commands and timers until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Block fetcher started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }
            let now = Instant::now();
            self.promote(now);
            self.expire(now);
            self.import();
        }
        debug!("Block fetcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Notify(announce) => self.on_announce(announce),
            Command::Enqueue { peer, block } => self.on_block(peer, block),
            Command::FilterHeaders {
                peer,
                headers,
                time,
                reply,
            } => {
                let rest = self.on_headers(&peer, headers, time);
                let _ = reply.send(rest);
            }
            Command::FilterBodies {
                peer,
                bodies,
                time: _,
                downloader_expecting,
                reply,
            } => {
                let rest = self.on_bodies(&peer, bodies, downloader_expecting);
                let _ = reply.send(rest);
            }
            Command::ForgetPeer(peer) => self.forget_peer(&peer),
            Command::Stats(reply) => {
                let _ = reply.send(BlockFetcherStats {
                    announced: self.announced.len(),
                    fetching: self.fetching.len(),
                    completing: self.completing.len(),
                    queued: self.queued.len(),
                });
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let waiting = self.announced.values().map(|w| w.ready_at);
        let fetching = self.fetching.values().map(|f| f.deadline);
        let completing = self.completing.values().map(|c| c.deadline);
        waiting.chain(fetching).chain(completing).min()
    }

    fn is_known(&self, hash: &H256, number: u64) -> bool {
        self.imported.contains(hash)
            || self.queued.contains_key(hash)
            || self.chain.has_block(hash, number)
    }

    /// Whether `number` is within the window around the local head that the
    /// fetcher tracks.
    fn in_range(&self, number: u64) -> bool {
        let head = self.chain.current_block().number;
        number.saturating_add(self.config.max_uncle_dist) >= head
            && number <= head.saturating_add(self.config.max_queue_dist)
    }

    fn release(&mut self, announce: &BlockAnnounce) {
        if let Some(count) = self.announce_counts.get_mut(&announce.peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.announce_counts.remove(&announce.peer);
            }
        }
    }

    fn release_all(&mut self, announces: &[BlockAnnounce]) {
        for announce in announces {
            self.release(announce);
        }
    }

    fn on_announce(&mut self, announce: BlockAnnounce) {
        let metrics = &self.metrics.block_fetcher;
        metrics.announces_in.inc();
        let count = self.announce_counts.get(&announce.peer).copied().unwrap_or(0);
        if count >= self.config.hash_limit {
            metrics.announces_dos.inc();
            debug!(peer = %announce.peer, limit = self.config.hash_limit, "Peer exceeded announcement limit");
            return;
        }
        if !self.in_range(announce.number) {
            metrics.announces_dropped.inc();
            trace!(peer = %announce.peer, number = announce.number, "Discarded distant announcement");
            return;
        }
        if self.is_known(&announce.hash, announce.number) {
            return;
        }

        let hash = announce.hash;
        let peer = announce.peer.clone();
        let merged = if let Some(fetching) = self.fetching.get_mut(&hash) {
            merge(&mut fetching.alternates, Some(&fetching.announce), announce)
        } else if let Some(completing) = self.completing.get_mut(&hash) {
            merge(&mut completing.alternates, Some(&completing.announce), announce)
        } else {
            let ready_at =
                announce.time + self.config.arrive_timeout + jitter(self.config.gather_slack);
            let waiting = self.announced.entry(hash).or_insert_with(|| Waiting {
                ready_at,
                announces: Vec::new(),
            });
            merge(&mut waiting.announces, None, announce)
        };
        if merged {
            *self.announce_counts.entry(peer).or_default() += 1;
        }
    }

    fn on_block(&mut self, peer: PeerId, block: Block) {
        let metrics = &self.metrics.block_fetcher;
        metrics.broadcasts_in.inc();
        let count = self.queued_counts.get(&peer).copied().unwrap_or(0);
        if count >= self.config.block_limit {
            metrics.broadcasts_dos.inc();
            debug!(peer = %peer, limit = self.config.block_limit, "Peer exceeded queued block limit");
            return;
        }
        if !self.in_range(block.number()) {
            metrics.broadcasts_dropped.inc();
            trace!(peer = %peer, number = block.number(), "Discarded distant block");
            return;
        }
        if !block.body.matches(&block.header) {
            metrics.body_mismatches.inc();
            warn!(peer = %peer, number = block.number(), "Propagated block body does not match header");
            self.peers.penalize(&peer, PenaltyReason::BodyMismatch);
            return;
        }
        self.push_queue(peer, block);
    }

    fn on_headers(&mut self, peer: &PeerId, headers: Vec<Header>, time: Instant) -> Vec<Header> {
        let mut rest = Vec::new();
        let mut wanted = Vec::new();
        let mut request: Option<BodyRequester> = None;

        for header in headers {
            let hash = header.hash();
            if !self
                .fetching
                .get(&hash)
                .is_some_and(|f| f.announce.peer == *peer)
            {
                rest.push(header);
                continue;
            }
            let Some(Fetching {
                announce,
                alternates,
                ..
            }) = self.fetching.remove(&hash)
            else {
                continue;
            };

            if header.number != announce.number {
                warn!(
                    peer = %peer,
                    announced = announce.number,
                    delivered = header.number,
                    "Announced block number mismatch"
                );
                self.peers.penalize(peer, PenaltyReason::AnnouncementMismatch);
                self.release(&announce);
                self.fetch_header(hash, alternates, time);
                continue;
            }
            if self.is_known(&hash, header.number) {
                self.release(&announce);
                self.release_all(&alternates);
                continue;
            }
            if header.has_empty_body() {
                trace!(number = header.number, "Announced block has an empty body");
                self.release(&announce);
                self.release_all(&alternates);
                self.push_queue(peer.clone(), Block::new(header, Body::default()));
                continue;
            }

            request.get_or_insert_with(|| Arc::clone(&announce.fetch_bodies));
            wanted.push(hash);
            self.completing.insert(
                hash,
                Completing {
                    announce,
                    alternates,
                    header,
                    deadline: time + self.config.fetch_timeout,
                },
            );
        }

        if let Some(request) = request {
            self.metrics.block_fetcher.body_fetches.inc();
            trace!(peer = %peer, count = wanted.len(), "Requesting announced bodies");
            if let Err(err) = request(wanted.clone()) {
                debug!(peer = %peer, error = %err, "Body request failed");
                for hash in wanted {
                    if let Some(completing) = self.completing.remove(&hash) {
                        self.release(&completing.announce);
                        self.fetch_header(hash, completing.alternates, time);
                    }
                }
            }
        }
        rest
    }

    fn on_bodies(
        &mut self,
        peer: &PeerId,
        bodies: Vec<Body>,
        downloader_expecting: bool,
    ) -> Vec<Body> {
        let pending: Vec<H256> = self
            .completing
            .iter()
            .filter(|(_, c)| c.announce.peer == *peer)
            .map(|(hash, _)| *hash)
            .collect();
        if pending.is_empty() {
            return bodies;
        }

        let mut rest = Vec::new();
        for body in bodies {
            let hit = pending.iter().copied().find(|hash| {
                self.completing
                    .get(hash)
                    .is_some_and(|c| body.matches(&c.header))
            });
            match hit.and_then(|hash| self.completing.remove(&hash)) {
                Some(completing) => {
                    self.release(&completing.announce);
                    self.release_all(&completing.alternates);
                    self.push_queue(peer.clone(), Block::new(completing.header, body));
                }
                None => rest.push(body),
            }
        }

        if !rest.is_empty() && !downloader_expecting {
            self.metrics.block_fetcher.body_mismatches.inc();
            warn!(peer = %peer, count = rest.len(), "Bodies match no pending header");
            self.peers.penalize(peer, PenaltyReason::BodyMismatch);
            rest.clear();
        }
        rest
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.announced.retain(|_, waiting| {
            waiting.announces.retain(|a| a.peer != *peer);
            !waiting.announces.is_empty()
        });

        let now = Instant::now();
        let lost: Vec<H256> = self
            .fetching
            .iter()
            .filter(|(_, f)| f.announce.peer == *peer)
            .map(|(hash, _)| *hash)
            .collect();
        for fetching in self.fetching.values_mut() {
            fetching.alternates.retain(|a| a.peer != *peer);
        }
        for hash in lost {
            if let Some(fetching) = self.fetching.remove(&hash) {
                self.fetch_header(hash, fetching.alternates, now);
            }
        }

        let lost: Vec<H256> = self
            .completing
            .iter()
            .filter(|(_, c)| c.announce.peer == *peer)
            .map(|(hash, _)| *hash)
            .collect();
        for completing in self.completing.values_mut() {
            completing.alternates.retain(|a| a.peer != *peer);
        }
        for hash in lost {
            if let Some(completing) = self.completing.remove(&hash) {
                self.fetch_header(hash, completing.alternates, now);
            }
        }

        self.announce_counts.remove(peer);
        trace!(peer = %peer, "Forgot peer announcements");
    }

    /// Move announcements whose arrival timer expired to header fetching.
    fn promote(&mut self, now: Instant) {
        let ready: Vec<H256> = self
            .announced
            .iter()
            .filter(|(_, w)| w.ready_at <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in ready {
            let Some(waiting) = self.announced.remove(&hash) else {
                continue;
            };
            let number = waiting.announces.first().map_or(0, |a| a.number);
            if self.is_known(&hash, number) {
                self.release_all(&waiting.announces);
                continue;
            }
            self.fetch_header(hash, waiting.announces, now);
        }
    }

    /// Request the header of `hash` from a random candidate, falling back to
    /// the others if sending fails.
    fn fetch_header(&mut self, hash: H256, mut candidates: Vec<BlockAnnounce>, now: Instant) {
        while !candidates.is_empty() {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            let announce = candidates.swap_remove(index);
            self.metrics.block_fetcher.header_fetches.inc();
            match (announce.fetch_header)(hash) {
                Ok(()) => {
                    trace!(peer = %announce.peer, hash = %hash.short(), "Requested announced header");
                    self.fetching.insert(
                        hash,
                        Fetching {
                            announce,
                            alternates: candidates,
                            deadline: now + self.config.fetch_timeout,
                        },
                    );
                    return;
                }
                Err(err) => {
                    debug!(peer = %announce.peer, error = %err, "Header request failed");
                    self.release(&announce);
                }
            }
        }
        debug!(hash = %hash.short(), "No announcers left for block");
    }

    /// Retry requests that outlived the fetch timeout on other announcers.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<H256> = self
            .fetching
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            if let Some(fetching) = self.fetching.remove(&hash) {
                self.metrics.block_fetcher.header_timeouts.inc();
                debug!(peer = %fetching.announce.peer, hash = %hash.short(), "Header request timed out");
                self.release(&fetching.announce);
                self.fetch_header(hash, fetching.alternates, now);
            }
        }

        let expired: Vec<H256> = self
            .completing
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            if let Some(completing) = self.completing.remove(&hash) {
                self.metrics.block_fetcher.body_timeouts.inc();
                debug!(peer = %completing.announce.peer, hash = %hash.short(), "Body request timed out");
                self.release(&completing.announce);
                self.fetch_header(hash, completing.alternates, now);
            }
        }
    }

    fn push_queue(&mut self, peer: PeerId, block: Block) {
        let hash = block.hash();
        let number = block.number();
        if self.is_known(&hash, number) {
            return;
        }
        self.forget_hash(&hash);
        *self.queued_counts.entry(peer.clone()).or_default() += 1;
        self.queue.push(Reverse((number, hash)));
        self.queued.insert(hash, Queued { peer, block });
        trace!(number, hash = %hash.short(), "Queued block for import");
    }

    /// Stop fetching `hash`; the block arrived by other means.
    fn forget_hash(&mut self, hash: &H256) {
        if let Some(waiting) = self.announced.remove(hash) {
            self.release_all(&waiting.announces);
        }
        if let Some(fetching) = self.fetching.remove(hash) {
            self.release(&fetching.announce);
            self.release_all(&fetching.alternates);
        }
        if let Some(completing) = self.completing.remove(hash) {
            self.release(&completing.announce);
            self.release_all(&completing.alternates);
        }
    }

    /// Import queued blocks whose parent is the local head.
    fn import(&mut self) {
        while let Some(&Reverse((number, hash))) = self.queue.peek() {
            let head = self.chain.current_block().number;
            if number > head.saturating_add(1) {
                break;
            }
            self.queue.pop();
            let Some(Queued { peer, block }) = self.queued.remove(&hash) else {
                continue;
            };
            if let Some(count) = self.queued_counts.get_mut(&peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.queued_counts.remove(&peer);
                }
            }
            if number.saturating_add(self.config.max_uncle_dist) < head
                || self.chain.has_block(&hash, number)
            {
                trace!(number, "Discarded stale queued block");
                continue;
            }
            self.insert(&peer, block);
        }
    }

    fn insert(&mut self, peer: &PeerId, block: Block) {
        let metrics = &self.metrics.block_fetcher;
        let hash = block.hash();
        let number = block.number();
        if self.flags.is_fast_sync() {
            metrics.discarded_fast_sync.inc();
            debug!(number, "Discarded propagated block during fast sync");
            return;
        }
        let Some(parent) = self.chain.header_by_hash(&block.header.parent_hash) else {
            debug!(number, peer = %peer, "Propagated block has unknown parent");
            return;
        };
        if let Err(err) = self.engine.verify_header(&block.header, &parent) {
            metrics.import_failed.inc();
            warn!(peer = %peer, number, error = %err, "Propagated block failed verification");
            self.peers.drop_peer(peer, DisconnectReason::InvalidChain);
            return;
        }

        let result = {
            let _guard = self.chain_lock.lock();
            self.chain.insert_bodies(vec![block])
        };
        match result {
            Ok(_) => {
                metrics.imported.inc();
                self.imported.put(hash, ());
                debug!(number, hash = %hash.short(), peer = %peer, "Imported propagated block");
                if self.flags.enable_txs() {
                    info!(number, "Enabled transaction acceptance");
                }
            }
            Err(err) => {
                metrics.import_failed.inc();
                warn!(number, error = %err, "Propagated block import failed");
            }
        }
    }
}

/// Add `announce` to `list` unless its peer already announced the hash.
/// Returns whether it was added.
fn merge(
    list: &mut Vec<BlockAnnounce>,
    current: Option<&BlockAnnounce>,
    announce: BlockAnnounce,
) -> bool {
    let duplicate = current.is_some_and(|c| c.peer == announce.peer)
        || list.iter().any(|a| a.peer == announce.peer);
    if duplicate {
        return false;
    }
    list.push(announce);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{peer_id, TestChain};
    use avn_chain::{BasicEngine, MemoryChain};
    use avn_network::{Capability, NullTransport, Peer, PeerHead};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Requests {
        headers: AtomicUsize,
        bodies: AtomicUsize,
    }

    struct Harness {
        chain: TestChain,
        local: Arc<MemoryChain>,
        peers: Arc<PeerSet>,
        metrics: Arc<SyncMetrics>,
        flags: Arc<SyncFlags>,
        fetcher: BlockFetcher,
        requests: Arc<Requests>,
        _shutdown: tokio_util::sync::DropGuard,
    }

    fn harness(local_height: u64, config: BlockFetcherConfig) -> Harness {
        let chain = TestChain::new(20);
        let local = chain.store_upto(local_height);
        let peers = Arc::new(PeerSet::new());
        for n in 1..=5 {
            let peer = Peer::new(
                peer_id(n),
                avn_network::PROTOCOL_VERSION,
                [Capability::Eth],
                PeerHead {
                    hash: chain.head().hash(),
                    td: chain.td(),
                },
                Arc::new(NullTransport),
            );
            peers.register(Arc::new(peer)).unwrap();
        }
        let metrics = Arc::new(SyncMetrics::new());
        let flags = Arc::new(SyncFlags::new(false));
        let (fetcher, task) = BlockFetcher::new(
            config,
            Arc::clone(&local) as Arc<dyn ChainStore>,
            Arc::new(BasicEngine),
            Arc::clone(&peers),
            Arc::clone(&metrics),
            Arc::new(Mutex::new(())),
            Arc::clone(&flags),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(task.run(shutdown.clone()));
        Harness {
            chain,
            local,
            peers,
            metrics,
            flags,
            fetcher,
            requests: Arc::new(Requests::default()),
            _shutdown: shutdown.drop_guard(),
        }
    }

    impl Harness {
        fn announce(&self, peer: u8, number: u64) -> BlockAnnounce {
            let headers = Arc::clone(&self.requests);
            let bodies = Arc::clone(&self.requests);
            BlockAnnounce {
                peer: peer_id(peer),
                hash: self.chain.blocks[number as usize].hash(),
                number,
                time: Instant::now(),
                fetch_header: Arc::new(move |_: H256| -> NetworkResult<()> {
                    headers.headers.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                fetch_bodies: Arc::new(move |_: Vec<H256>| -> NetworkResult<()> {
                    bodies.bodies.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            }
        }

        fn header_requests(&self) -> usize {
            self.requests.headers.load(Ordering::SeqCst)
        }

        fn body_requests(&self) -> usize {
            self.requests.bodies.load(Ordering::SeqCst)
        }

        async fn stats(&self) -> BlockFetcherStats {
            self.fetcher.stats().await.unwrap()
        }
    }

    /// Past the arrival timer including the maximum jitter.
    const ARRIVED: Duration = Duration::from_millis(700);

    #[tokio::test(start_paused = true)]
    async fn test_announcers_share_one_header_request() {
        let h = harness(8, BlockFetcherConfig::default());
        for peer in 1..=5 {
            h.fetcher.notify(h.announce(peer, 9)).await.unwrap();
        }
        assert_eq!(h.stats().await.announced, 1);
        assert_eq!(h.header_requests(), 0);

        tokio::time::sleep(ARRIVED).await;

        let stats = h.stats().await;
        assert_eq!(stats.announced, 0);
        assert_eq!(stats.fetching, 1);
        assert_eq!(h.header_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_to_next_announcer() {
        let h = harness(8, BlockFetcherConfig::default());
        h.fetcher.notify(h.announce(1, 9)).await.unwrap();
        h.fetcher.notify(h.announce(2, 9)).await.unwrap();

        tokio::time::sleep(ARRIVED).await;
        assert_eq!(h.header_requests(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.header_requests(), 2);
        assert_eq!(h.stats().await.fetching, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.header_requests(), 2);
        assert_eq!(h.stats().await, BlockFetcherStats::default());
        assert_eq!(h.metrics.block_fetcher.header_timeouts.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announced_block_fetched_and_imported() {
        let h = harness(7, BlockFetcherConfig::default());
        let block = h.chain.blocks[8].clone();
        assert!(!block.body.is_empty());
        h.fetcher.notify(h.announce(1, 8)).await.unwrap();
        tokio::time::sleep(ARRIVED).await;

        let rest = h
            .fetcher
            .filter_headers(&peer_id(1), vec![block.header.clone()], Instant::now())
            .await;
        assert!(rest.is_empty());
        assert_eq!(h.body_requests(), 1);
        assert_eq!(h.stats().await.completing, 1);

        let rest = h
            .fetcher
            .filter_bodies(&peer_id(1), vec![block.body.clone()], Instant::now(), false)
            .await;
        assert!(rest.is_empty());
        assert_eq!(h.stats().await, BlockFetcherStats::default());

        assert_eq!(h.local.current_block().hash(), block.hash());
        assert_eq!(h.metrics.block_fetcher.imported.get(), 1);
        assert!(h.flags.accepts_txs());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_completes_without_body_request() {
        let h = harness(8, BlockFetcherConfig::default());
        let header = h.chain.blocks[9].header.clone();
        assert!(header.has_empty_body());
        h.fetcher.notify(h.announce(2, 9)).await.unwrap();
        tokio::time::sleep(ARRIVED).await;

        let rest = h
            .fetcher
            .filter_headers(&peer_id(2), vec![header], Instant::now())
            .await;
        assert!(rest.is_empty());
        h.stats().await;

        assert_eq!(h.body_requests(), 0);
        assert_eq!(h.local.current_block().number, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrequested_headers_pass_through() {
        let h = harness(8, BlockFetcherConfig::default());
        h.fetcher.notify(h.announce(1, 9)).await.unwrap();
        tokio::time::sleep(ARRIVED).await;

        let headers = vec![h.chain.blocks[9].header.clone(), h.chain.blocks[3].header.clone()];
        // Same hash but from a peer the fetcher did not ask.
        let rest = h
            .fetcher
            .filter_headers(&peer_id(4), headers.clone(), Instant::now())
            .await;
        assert_eq!(rest, headers);
        assert_eq!(h.stats().await.fetching, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_number_mismatch_penalizes_announcer() {
        let h = harness(8, BlockFetcherConfig::default());
        let mut announce = h.announce(1, 9);
        announce.number = 10;
        h.fetcher.notify(announce).await.unwrap();
        tokio::time::sleep(ARRIVED).await;

        h.fetcher
            .filter_headers(&peer_id(1), vec![h.chain.blocks[9].header.clone()], Instant::now())
            .await;

        let peer = h.peers.peer(&peer_id(1)).unwrap();
        assert!(peer.score().current_penalty() > 0);
        assert_eq!(h.stats().await, BlockFetcherStats::default());
        assert_eq!(h.local.current_block().number, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_bodies_are_a_mismatch() {
        let h = harness(7, BlockFetcherConfig::default());
        h.fetcher.notify(h.announce(1, 8)).await.unwrap();
        tokio::time::sleep(ARRIVED).await;
        h.fetcher
            .filter_headers(&peer_id(1), vec![h.chain.blocks[8].header.clone()], Instant::now())
            .await;

        let wrong = h.chain.blocks[10].body.clone();
        let rest = h
            .fetcher
            .filter_bodies(&peer_id(1), vec![wrong.clone()], Instant::now(), false)
            .await;
        assert!(rest.is_empty());
        assert_eq!(h.metrics.block_fetcher.body_mismatches.get(), 1);
        assert_eq!(h.local.current_block().number, 7);

        // Bodies the downloader waits for are handed back untouched.
        let rest = h
            .fetcher
            .filter_bodies(&peer_id(1), vec![wrong.clone()], Instant::now(), true)
            .await;
        assert_eq!(rest, vec![wrong]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueued_blocks_import_in_order() {
        let h = harness(5, BlockFetcherConfig::default());
        h.fetcher
            .enqueue(&peer_id(1), h.chain.blocks[7].clone())
            .await
            .unwrap();
        assert_eq!(h.stats().await.queued, 1);
        assert_eq!(h.local.current_block().number, 5);

        h.fetcher
            .enqueue(&peer_id(2), h.chain.blocks[6].clone())
            .await
            .unwrap();
        assert_eq!(h.stats().await.queued, 0);
        assert_eq!(h.local.current_block().number, 7);
        assert_eq!(h.metrics.block_fetcher.imported.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueued_block_cancels_announcement() {
        let h = harness(5, BlockFetcherConfig::default());
        h.fetcher.notify(h.announce(1, 6)).await.unwrap();
        h.fetcher
            .enqueue(&peer_id(2), h.chain.blocks[6].clone())
            .await
            .unwrap();
        tokio::time::sleep(ARRIVED).await;

        assert_eq!(h.header_requests(), 0);
        assert_eq!(h.local.current_block().number, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampered_block_rejected() {
        let h = harness(5, BlockFetcherConfig::default());
        let mut block = h.chain.blocks[7].clone();
        block.body.transactions.pop();
        h.fetcher.enqueue(&peer_id(3), block).await.unwrap();
        h.stats().await;

        assert_eq!(h.metrics.block_fetcher.body_mismatches.get(), 1);
        assert_eq!(h.local.current_block().number, 5);
        let peer = h.peers.peer(&peer_id(3)).unwrap();
        assert!(peer.score().current_penalty() >= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_discarded_during_fast_sync() {
        let h = harness(5, BlockFetcherConfig::default());
        h.flags.set_fast_sync(true);
        h.fetcher
            .enqueue(&peer_id(1), h.chain.blocks[6].clone())
            .await
            .unwrap();
        h.stats().await;

        assert_eq!(h.metrics.block_fetcher.discarded_fast_sync.get(), 1);
        assert_eq!(h.local.current_block().number, 5);
        assert!(!h.flags.accepts_txs());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distant_announcements_dropped() {
        let h = harness(
            2,
            BlockFetcherConfig {
                max_queue_dist: 4,
                ..Default::default()
            },
        );
        h.fetcher.notify(h.announce(1, 10)).await.unwrap();
        h.fetcher
            .enqueue(&peer_id(1), h.chain.blocks[12].clone())
            .await
            .unwrap();

        assert_eq!(h.stats().await, BlockFetcherStats::default());
        assert_eq!(h.metrics.block_fetcher.announces_dropped.get(), 1);
        assert_eq!(h.metrics.block_fetcher.broadcasts_dropped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_peer_announcement_limit() {
        let h = harness(
            8,
            BlockFetcherConfig {
                hash_limit: 2,
                ..Default::default()
            },
        );
        for number in 9..12 {
            h.fetcher.notify(h.announce(1, number)).await.unwrap();
        }
        h.fetcher.notify(h.announce(2, 11)).await.unwrap();

        assert_eq!(h.stats().await.announced, 3);
        assert_eq!(h.metrics.block_fetcher.announces_dos.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_peer_drops_its_announcements() {
        let h = harness(8, BlockFetcherConfig::default());
        h.fetcher.notify(h.announce(1, 9)).await.unwrap();
        h.fetcher.notify(h.announce(1, 10)).await.unwrap();
        h.fetcher.notify(h.announce(2, 10)).await.unwrap();

        h.fetcher.forget_peer(&peer_id(1)).await;
        assert_eq!(h.stats().await.announced, 1);

        tokio::time::sleep(ARRIVED).await;
        assert_eq!(h.header_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_block_numbers_discarded() {
        let h = harness(8, BlockFetcherConfig::default());
        let mut announce = h.announce(1, 9);
        announce.number = u64::MAX;
        h.fetcher.notify(announce).await.unwrap();

        let mut block = h.chain.blocks[9].clone();
        block.header.number = u64::MAX;
        h.fetcher.enqueue(&peer_id(2), block).await.unwrap();

        // The fetcher is still running and tracks nothing.
        assert_eq!(h.stats().await, BlockFetcherStats::default());
        assert_eq!(h.metrics.block_fetcher.announces_dropped.get(), 1);
        assert_eq!(h.metrics.block_fetcher.broadcasts_dropped.get(), 1);

        h.fetcher.notify(h.announce(3, 9)).await.unwrap();
        assert_eq!(h.stats().await.announced, 1);
    }
}
