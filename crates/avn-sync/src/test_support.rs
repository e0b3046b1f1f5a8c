//! Fixtures shared by the unit tests: generated chains and peers that serve
//! them straight into a downloader.

use crate::config::DownloaderConfig;
use crate::downloader::Downloader;
use crate::metrics::SyncMetrics;
use avn_chain::{
    empty_root, receipts_root, BasicEngine, Block, Body, ChainStore, Engine, Header, MemoryChain,
    Receipt, StateNode, TotalDifficulty, Transaction, H256,
};
use avn_network::{
    Capability, DisconnectReason, NetworkResult, Peer, PeerHead, PeerId, PeerSet, PeerTransport,
    RequestKind,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

pub fn peer_id(n: u8) -> PeerId {
    PeerId(vec![n])
}

/// A generated chain with receipts and per-block state.
#[derive(Clone)]
pub struct TestChain {
    pub blocks: Vec<Block>,
    pub receipts: Vec<Vec<Receipt>>,
    pub states: Vec<Vec<StateNode>>,
}

impl TestChain {
    /// Genesis plus `len` blocks.
    pub fn new(len: u64) -> Self {
        Self::genesis().extend(len, 0, 1)
    }

    fn genesis() -> Self {
        let state = vec![StateNode::leaf(b"genesis".to_vec())];
        let header = Header {
            number: 0,
            parent_hash: H256::ZERO,
            state_root: state[0].hash(),
            tx_root: empty_root(),
            uncle_hash: empty_root(),
            receipt_root: empty_root(),
            difficulty: 1,
            timestamp: 1_000,
            extra: Bytes::new(),
        };
        Self {
            blocks: vec![Block::new(header, Body::default())],
            receipts: vec![Vec::new()],
            states: vec![state],
        }
    }

    /// Append `len` blocks built with `seed` and `difficulty`.
    pub fn extend(&self, len: u64, seed: u8, difficulty: u128) -> Self {
        let mut chain = self.clone();
        for _ in 0..len {
            let (block, receipts, state) = make_block(&chain.head().header, seed, difficulty);
            chain.blocks.push(block);
            chain.receipts.push(receipts);
            chain.states.push(state);
        }
        chain
    }

    /// Keep blocks up to `number` and grow a branch of `len` blocks.
    pub fn fork(&self, number: u64, len: u64, seed: u8, difficulty: u128) -> Self {
        self.truncated(number).extend(len, seed, difficulty)
    }

    pub fn truncated(&self, number: u64) -> Self {
        let keep = number as usize + 1;
        Self {
            blocks: self.blocks[..keep].to_vec(),
            receipts: self.receipts[..keep].to_vec(),
            states: self.states[..keep].to_vec(),
        }
    }

    pub fn head(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn td(&self) -> TotalDifficulty {
        self.blocks.iter().map(|b| b.header.difficulty).sum()
    }

    /// A store holding every block with receipts and state.
    pub fn store(&self) -> Arc<MemoryChain> {
        self.store_upto(self.head().number())
    }

    /// A store holding blocks up to `number`.
    pub fn store_upto(&self, number: u64) -> Arc<MemoryChain> {
        let chain = MemoryChain::new(self.blocks[0].clone(), self.states[0].clone());
        let end = number as usize + 1;
        for state in &self.states[1..end] {
            for node in state {
                chain.write_state_node(node.hash(), node.encode()).unwrap();
            }
        }
        chain.insert_bodies(self.blocks[1..end].to_vec()).unwrap();
        chain
            .insert_receipt_chain(self.blocks[1..end].to_vec(), self.receipts[1..end].to_vec())
            .unwrap();
        Arc::new(chain)
    }
}

fn make_block(parent: &Header, seed: u8, difficulty: u128) -> (Block, Vec<Receipt>, Vec<StateNode>) {
    let number = parent.number + 1;
    let transactions: Vec<Transaction> = if number % 3 == 0 {
        Vec::new()
    } else {
        (0..2u64)
            .map(|i| Transaction::new(number * 10 + i, vec![seed, number as u8, i as u8]))
            .collect()
    };
    let receipts: Vec<Receipt> = transactions
        .iter()
        .map(|tx| Receipt {
            tx_hash: tx.hash(),
            success: true,
            gas_used: 21_000,
        })
        .collect();
    let leaves = [
        StateNode::leaf(format!("{seed}-{number}-a").into_bytes()),
        StateNode::leaf(format!("{seed}-{number}-b").into_bytes()),
    ];
    let root = StateNode::branch(leaves.iter().map(StateNode::hash).collect(), vec![seed]);
    let body = Body {
        transactions,
        uncles: Vec::new(),
    };
    let header = Header {
        number,
        parent_hash: parent.hash(),
        state_root: root.hash(),
        tx_root: body.tx_root(),
        uncle_hash: body.uncle_hash(),
        receipt_root: receipts_root(&receipts),
        difficulty,
        timestamp: parent.timestamp + 10,
        extra: Bytes::from(vec![seed]),
    };
    let mut state = vec![root];
    state.extend(leaves);
    (Block::new(header, body), receipts, state)
}

/// Headers served for a by-number request.
pub fn serve_headers(
    chain: &dyn ChainStore,
    origin: u64,
    amount: u64,
    skip: u64,
    reverse: bool,
) -> Vec<Header> {
    let step = skip + 1;
    let mut out = Vec::new();
    for i in 0..amount {
        let number = if reverse {
            origin.checked_sub(i * step)
        } else {
            origin.checked_add(i * step)
        };
        match number.and_then(|n| chain.header_by_number(n)) {
            Some(header) => out.push(header),
            None => break,
        }
    }
    out
}

/// Misbehaviour switches of a serving peer.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Request kinds left unanswered.
    pub silent: HashSet<RequestKind>,
    /// Serve bodies with one transaction removed.
    pub tamper_bodies: bool,
    /// Serve receipt lists with one receipt removed.
    pub tamper_receipts: bool,
    /// Answer dense header requests starting at or above this number with
    /// nothing.
    pub withhold_fills_from: Option<u64>,
}

/// Transport answering requests from a chain store by delivering straight
/// into the downloader.
pub struct ServingTransport {
    id: PeerId,
    chain: Arc<MemoryChain>,
    downloader: OnceLock<Weak<Downloader>>,
    pub behavior: Mutex<Behavior>,
    pub requests: Mutex<Vec<RequestKind>>,
    pub disconnected: Mutex<Option<DisconnectReason>>,
}

impl ServingTransport {
    pub fn new(id: PeerId, chain: Arc<MemoryChain>) -> Self {
        Self {
            id,
            chain,
            downloader: OnceLock::new(),
            behavior: Mutex::new(Behavior::default()),
            requests: Mutex::new(Vec::new()),
            disconnected: Mutex::new(None),
        }
    }

    pub fn attach(&self, downloader: &Arc<Downloader>) {
        let _ = self.downloader.set(Arc::downgrade(downloader));
    }

    pub fn requests_of(&self, kind: RequestKind) -> usize {
        self.requests.lock().iter().filter(|k| **k == kind).count()
    }

    fn answer(&self, kind: RequestKind) -> Option<Arc<Downloader>> {
        self.requests.lock().push(kind);
        if self.behavior.lock().silent.contains(&kind) {
            return None;
        }
        self.downloader.get().and_then(Weak::upgrade)
    }
}

impl PeerTransport for ServingTransport {
    fn request_headers_by_hash(
        &self,
        origin: H256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        if let Some(d) = self.answer(RequestKind::Headers) {
            let headers = self
                .chain
                .header_by_hash(&origin)
                .map(|h| serve_headers(self.chain.as_ref(), h.number, amount, skip, reverse))
                .unwrap_or_default();
            let _ = d.deliver_headers(&self.id, headers);
        }
        Ok(())
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        if let Some(d) = self.answer(RequestKind::Headers) {
            let withheld = self
                .behavior
                .lock()
                .withhold_fills_from
                .is_some_and(|n| skip == 0 && amount > 1 && !reverse && origin >= n);
            let headers = if withheld {
                Vec::new()
            } else {
                serve_headers(self.chain.as_ref(), origin, amount, skip, reverse)
            };
            let _ = d.deliver_headers(&self.id, headers);
        }
        Ok(())
    }

    fn request_bodies(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if let Some(d) = self.answer(RequestKind::Bodies) {
            let tamper = self.behavior.lock().tamper_bodies;
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
            let _ = d.deliver_bodies(&self.id, bodies);
        }
        Ok(())
    }

    fn request_receipts(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if let Some(d) = self.answer(RequestKind::Receipts) {
            let tamper = self.behavior.lock().tamper_receipts;
            let receipts = hashes
                .iter()
                .filter_map(|h| self.chain.receipts_by_hash(h))
                .map(|mut list| {
                    if tamper {
                        list.pop();
                    }
                    list
                })
                .collect();
            let _ = d.deliver_receipts(&self.id, receipts);
        }
        Ok(())
    }

    fn request_node_data(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        if let Some(d) = self.answer(RequestKind::State) {
            let data = hashes
                .iter()
                .filter_map(|h| self.chain.state_node(h))
                .collect();
            let _ = d.deliver_node_data(&self.id, data);
        }
        Ok(())
    }

    fn request_pooled_transactions(&self, _hashes: Vec<H256>) -> NetworkResult<()> {
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) {
        *self.disconnected.lock() = Some(reason);
    }
}

/// Downloader config with small batches so short chains exercise the
/// skeleton and chunking paths.
pub fn small_config() -> DownloaderConfig {
    DownloaderConfig {
        max_header_fetch: 8,
        max_skeleton_size: 4,
        max_body_fetch: 4,
        max_receipt_fetch: 4,
        max_state_fetch: 4,
        block_chunk_size: 16,
        min_full_blocks: 4,
        ancestor_probe_count: 4,
        ancestor_probe_growth: 4,
        request_timeout: Duration::from_secs(1),
        idle_wait_timeout: Duration::from_secs(5),
        ..DownloaderConfig::default()
    }
}

/// A downloader over a local chain plus serving peers.
pub struct Fixture {
    pub local: Arc<MemoryChain>,
    pub peers: Arc<PeerSet>,
    pub metrics: Arc<SyncMetrics>,
    pub downloader: Arc<Downloader>,
}

impl Fixture {
    pub fn new(local: Arc<MemoryChain>, config: DownloaderConfig) -> Self {
        Self::with_engine(local, config, Arc::new(BasicEngine))
    }

    pub fn with_engine(
        local: Arc<MemoryChain>,
        config: DownloaderConfig,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let peers = Arc::new(PeerSet::new());
        let metrics = Arc::new(SyncMetrics::new());
        let downloader = Arc::new(Downloader::new(
            config,
            Arc::clone(&local) as Arc<dyn ChainStore>,
            engine,
            Arc::clone(&peers),
            Arc::clone(&metrics),
            Arc::new(Mutex::new(())),
        ));
        Self {
            local,
            peers,
            metrics,
            downloader,
        }
    }

    /// Register a peer serving `chain`, advertising its head.
    pub fn add_peer(&self, n: u8, chain: &TestChain) -> Arc<ServingTransport> {
        let transport = Arc::new(ServingTransport::new(peer_id(n), chain.store()));
        transport.attach(&self.downloader);
        let peer = Peer::new(
            peer_id(n),
            avn_network::PROTOCOL_VERSION,
            [Capability::Eth, Capability::Snap],
            PeerHead {
                hash: chain.head().hash(),
                td: chain.td(),
            },
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        );
        self.peers.register(Arc::new(peer)).unwrap();
        transport
    }
}
