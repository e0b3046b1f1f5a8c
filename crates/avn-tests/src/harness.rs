//! Test harness for integration tests.
//!
//! A `TestNode` runs the complete sync service over an in-memory chain.
//! Remote peers are `RemotePeer` transports that answer every request by
//! pushing reply packets back through the node's protocol handler, the way
//! a real connection would.

use crate::generators::{peer_id, TestChain};
use avn_chain::{BasicEngine, ChainStore, MemoryChain, Transaction, H256};
use avn_mempool::{Mempool, TxPool};
use avn_network::{
    Capability, DisconnectReason, NetworkError, NetworkResult, Packet, Peer, PeerHead, PeerId,
    PeerTransport, RequestKind, PROTOCOL_VERSION,
};
use avn_sync::{DownloaderConfig, SyncConfig, SyncMetrics, SyncMode, SyncResult, SyncService};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Inbound packets buffered per connection.
const CONNECTION_BUFFER: usize = 1024;

/// A request a remote peer received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    HeadersByHash {
        origin: H256,
        amount: u64,
    },
    HeadersByNumber {
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    },
    Bodies(Vec<H256>),
    Receipts(Vec<H256>),
    NodeData(Vec<H256>),
    PooledTransactions(Vec<H256>),
}

impl Request {
    /// Sync request kind, if the request is one.
    pub fn kind(&self) -> Option<RequestKind> {
        match self {
            Self::HeadersByHash { .. } | Self::HeadersByNumber { .. } => {
                Some(RequestKind::Headers)
            }
            Self::Bodies(_) => Some(RequestKind::Bodies),
            Self::Receipts(_) => Some(RequestKind::Receipts),
            Self::NodeData(_) => Some(RequestKind::State),
            Self::PooledTransactions(_) => None,
        }
    }
}

/// Ways a remote peer can misbehave.
#[derive(Debug, Clone, Default)]
pub struct Misbehavior {
    /// Request kinds left unanswered.
    pub silent: HashSet<RequestKind>,
    /// Serve bodies with their last transaction removed.
    pub tamper_bodies: bool,
}

/// The far end of a connection, serving a chain store.
pub struct RemotePeer {
    id: PeerId,
    chain: Arc<MemoryChain>,
    pool: Mutex<HashMap<H256, Transaction>>,
    outbound: mpsc::Sender<Packet>,
    pub misbehavior: Mutex<Misbehavior>,
    requests: Mutex<Vec<Request>>,
    disconnected: Mutex<Option<DisconnectReason>>,
}

impl RemotePeer {
    pub fn new(id: PeerId, chain: Arc<MemoryChain>, outbound: mpsc::Sender<Packet>) -> Self {
        Self {
            id,
            chain,
            pool: Mutex::new(HashMap::new()),
            outbound,
            misbehavior: Mutex::new(Misbehavior::default()),
            requests: Mutex::new(Vec::new()),
            disconnected: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Make transactions available for pooled-transaction requests.
    pub fn add_pooled(&self, txs: &[Transaction]) {
        let mut pool = self.pool.lock();
        for tx in txs {
            pool.insert(tx.hash(), tx.clone());
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn requests_of(&self, kind: RequestKind) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.kind() == Some(kind))
            .count()
    }

    /// Header requests naming `hash` as their origin.
    pub fn header_requests_for(&self, hash: &H256) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| matches!(r, Request::HeadersByHash { origin, .. } if origin == hash))
            .count()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnected.lock()
    }

    /// Push an unsolicited packet to the node.
    pub fn send(&self, packet: Packet) -> NetworkResult<()> {
        self.outbound
            .try_send(packet)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    /// Record a request; `false` if it should go unanswered.
    fn record(&self, request: Request) -> bool {
        trace!(peer = %self.id, ?request, "Remote request");
        let kind = request.kind();
        self.requests.lock().push(request);
        kind.map_or(true, |k| !self.misbehavior.lock().silent.contains(&k))
    }

    fn headers_from(&self, origin: u64, amount: u64, skip: u64, reverse: bool) -> Packet {
        let step = skip + 1;
        let mut headers = Vec::new();
        for i in 0..amount {
            let number = if reverse {
                origin.checked_sub(i * step)
            } else {
                origin.checked_add(i * step)
            };
            match number.and_then(|n| self.chain.header_by_number(n)) {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        Packet::BlockHeaders(headers)
    }
}

impl PeerTransport for RemotePeer {
    fn request_headers_by_hash(
        &self,
        origin: H256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        if !self.record(Request::HeadersByHash { origin, amount }) {
            return Ok(());
        }
        let reply = match self.chain.header_by_hash(&origin) {
            Some(header) => self.headers_from(header.number, amount, skip, reverse),
            None => Packet::BlockHeaders(Vec::new()),
        };
        self.send(reply)
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        let request = Request::HeadersByNumber {
            origin,
            amount,
            skip,
            reverse,
        };
        if !self.record(request) {
            return Ok(());
        }
        self.send(self.headers_from(origin, amount, skip, reverse))
    }

    fn request_bodies(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if !self.record(Request::Bodies(hashes.clone())) {
            return Ok(());
        }
        let tamper = self.misbehavior.lock().tamper_bodies;
        let bodies = hashes
            .iter()
            .filter_map(|h| self.chain.body_by_hash(h))
            .map(|mut body| {
                if tamper {
                    body.transactions.pop();
                }
                body
            })
            .collect();
        self.send(Packet::BlockBodies(bodies))
    }

    fn request_receipts(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if !self.record(Request::Receipts(hashes.clone())) {
            return Ok(());
        }
        let receipts = hashes
            .iter()
            .filter_map(|h| self.chain.receipts_by_hash(h))
            .collect();
        self.send(Packet::Receipts(receipts))
    }

    fn request_node_data(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if !self.record(Request::NodeData(hashes.clone())) {
            return Ok(());
        }
        let data = hashes
            .iter()
            .filter_map(|h| self.chain.state_node(h))
            .collect();
        self.send(Packet::NodeData(data))
    }

    fn request_pooled_transactions(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if !self.record(Request::PooledTransactions(hashes.clone())) {
            return Ok(());
        }
        let txs = {
            let pool = self.pool.lock();
            hashes.iter().filter_map(|h| pool.get(h).cloned()).collect()
        };
        self.send(Packet::PooledTransactions(txs))
    }

    fn disconnect(&self, reason: DisconnectReason) {
        *self.disconnected.lock() = Some(reason);
    }
}

/// Downloader settings with small batches so short chains exercise the
/// skeleton, chunking and pivot paths.
pub fn small_downloader_config() -> DownloaderConfig {
    DownloaderConfig {
        max_header_fetch: 8,
        max_skeleton_size: 4,
        max_body_fetch: 4,
        max_receipt_fetch: 4,
        max_state_fetch: 6,
        block_chunk_size: 16,
        min_full_blocks: 4,
        ancestor_probe_count: 4,
        ancestor_probe_growth: 4,
        request_timeout: Duration::from_secs(1),
        idle_wait_timeout: Duration::from_secs(5),
        ..DownloaderConfig::default()
    }
}

/// Sync settings for tests: small downloader batches, sync with a single
/// peer.
pub fn test_sync_config(mode: SyncMode) -> SyncConfig {
    let mut config = SyncConfig {
        mode,
        downloader: small_downloader_config(),
        ..Default::default()
    };
    config.chain_sync.min_peers = 1;
    config
}

/// One live connection between the node and a remote peer.
pub struct Connection {
    pub remote: Arc<RemotePeer>,
    pub peer: Arc<Peer>,
    task: JoinHandle<SyncResult<()>>,
}

impl Connection {
    /// Push a packet from the remote side.
    pub fn send(&self, packet: Packet) {
        self.remote.send(packet).expect("connection buffer has room");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the handler task to exit and return its result.
    pub async fn finish(self) -> SyncResult<()> {
        self.task.await.expect("peer handler panicked")
    }
}

/// A node running the full sync service over an in-memory chain.
pub struct TestNode {
    pub chain: Arc<MemoryChain>,
    pub pool: Arc<Mempool>,
    pub service: SyncService,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestNode {
    /// Build and start a node over `chain`.
    pub fn start(chain: Arc<MemoryChain>, config: SyncConfig) -> Self {
        let pool = Arc::new(Mempool::with_defaults());
        let mut service = SyncService::new(
            config,
            Arc::clone(&chain) as Arc<dyn ChainStore>,
            Arc::new(BasicEngine),
            Arc::clone(&pool) as Arc<dyn TxPool>,
            Arc::new(SyncMetrics::new()),
        );
        let shutdown = CancellationToken::new();
        let tasks = service.start(shutdown.clone());
        Self {
            chain,
            pool,
            service,
            shutdown,
            tasks,
        }
    }

    /// Connect peer `n` serving `remote` and advertising its head.
    pub fn connect(&self, n: u8, remote: &TestChain) -> Connection {
        self.connect_at(n, remote, remote.head().number())
    }

    /// Connect peer `n` serving `remote` but advertising block `number` as
    /// its head.
    pub fn connect_at(&self, n: u8, remote: &TestChain, number: u64) -> Connection {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let id = peer_id(n);
        let transport = Arc::new(RemotePeer::new(id.clone(), remote.store(), tx));
        let head = PeerHead {
            hash: remote.blocks[number as usize].hash(),
            td: remote.td_at(number),
        };
        let peer = Arc::new(Peer::new(
            id,
            PROTOCOL_VERSION,
            [Capability::Eth, Capability::Snap],
            head,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        ));
        let handler = Arc::clone(self.service.handler());
        let task = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { handler.run_peer(peer, rx).await }
        });
        Connection {
            remote: transport,
            peer,
            task,
        }
    }

    pub fn head(&self) -> u64 {
        self.chain.current_block().number
    }

    /// Stop the service and wait for its tasks.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            task.await.expect("sync task panicked");
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `check` every 50ms for up to `secs` seconds of (paused) time.
pub async fn eventually(secs: u64, check: impl Fn() -> bool) -> bool {
    for _ in 0..secs * 20 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
