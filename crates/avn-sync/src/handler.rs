//! Protocol handler.
//!
//! One `run_peer` task per connection. It registers the peer, challenges it
//! with the trusted checkpoint during fast sync, then routes inbound packets
//! to the fetchers and the downloader until the connection ends or the peer
//! misbehaves.

use crate::chainsync::ChainSyncHandle;
use crate::config::HandlerConfig;
use crate::downloader::Downloader;
use crate::fetcher::{
    BlockAnnounce, BlockFetcher, BodyRequester, HeaderRequester, TxFetcher, TxRequester,
};
use crate::flags::SyncFlags;
use crate::metrics::SyncMetrics;
use crate::{SyncError, SyncResult};
use avn_chain::{Block, ChainStore, Header, TotalDifficulty, Transaction, H256};
use avn_network::{DisconnectReason, Packet, Peer, PeerId, PeerSet, RequestKind};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Routes packets of every connected peer.
pub struct Handler {
    config: HandlerConfig,
    chain: Arc<dyn ChainStore>,
    peers: Arc<PeerSet>,
    downloader: Arc<Downloader>,
    block_fetcher: BlockFetcher,
    tx_fetcher: TxFetcher,
    chain_sync: ChainSyncHandle,
    flags: Arc<SyncFlags>,
    metrics: Arc<SyncMetrics>,
    /// Deadlines of pending checkpoint challenges.
    challenges: DashMap<PeerId, Instant>,
}

impl Handler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HandlerConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<PeerSet>,
        downloader: Arc<Downloader>,
        block_fetcher: BlockFetcher,
        tx_fetcher: TxFetcher,
        chain_sync: ChainSyncHandle,
        flags: Arc<SyncFlags>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            config,
            chain,
            peers,
            downloader,
            block_fetcher,
            tx_fetcher,
            chain_sync,
            flags,
            metrics,
            challenges: DashMap::new(),
        }
    }

    /// Serve one connection until `inbound` closes, the peer is closed, or
    /// the peer misbehaves. A misbehaving peer is dropped with the reason
    /// derived from the error, which is also returned.
    pub async fn run_peer(
        &self,
        peer: Arc<Peer>,
        mut inbound: mpsc::Receiver<Packet>,
    ) -> SyncResult<()> {
        let id = peer.id().clone();
        if let Err(err) = self.peers.register(Arc::clone(&peer)) {
            debug!(peer = %id, error = %err, "Peer registration failed");
            peer.disconnect(DisconnectReason::AlreadyConnected);
            return Err(err.into());
        }
        self.challenge(&peer);
        self.chain_sync.peer_event(&id).await;

        let result = self.serve(&peer, &mut inbound).await;
        if let Err(err) = &result {
            let reason = err
                .peer_fault()
                .map_or(DisconnectReason::ProtocolViolation, |(_, reason)| reason);
            self.metrics.handler.peers_dropped.inc();
            warn!(peer = %id, error = %err, %reason, "Peer handler failed");
            self.peers.drop_peer(&id, reason);
        }

        self.challenges.remove(&id);
        self.block_fetcher.forget_peer(&id).await;
        self.tx_fetcher.drop_peer(&id).await;
        let _ = self.peers.unregister(&id);
        self.chain_sync.peer_event(&id).await;
        debug!(peer = %id, "Peer handler exited");
        result
    }

    async fn serve(
        &self,
        peer: &Arc<Peer>,
        inbound: &mut mpsc::Receiver<Packet>,
    ) -> SyncResult<()> {
        let id = peer.id();
        loop {
            let deadline = self.challenges.get(id).map(|d| *d);
            tokio::select! {
                _ = peer.closed() => return Ok(()),
                packet = inbound.recv() => match packet {
                    Some(packet) => self.handle(peer, packet).await?,
                    None => return Ok(()),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.metrics.handler.challenges_failed.inc();
                    warn!(peer = %id, "Checkpoint challenge timed out");
                    return Err(SyncError::PeerUnresponsive(id.clone()));
                }
            }
        }
    }

    /// Ask the peer for the checkpoint header. Only done during fast sync
    /// with a checkpoint configured.
    fn challenge(&self, peer: &Peer) {
        let Some(checkpoint) = self.config.checkpoint else {
            return;
        };
        if !self.flags.is_fast_sync() {
            return;
        }
        match peer.request_headers_by_number(checkpoint.number, 1, 0, false) {
            Ok(()) => {
                self.metrics.handler.challenges_sent.inc();
                let deadline = Instant::now() + self.config.challenge_timeout;
                self.challenges.insert(peer.id().clone(), deadline);
                debug!(peer = %peer.id(), number = checkpoint.number, "Sent checkpoint challenge");
            }
            Err(err) => debug!(peer = %peer.id(), error = %err, "Checkpoint challenge not sent"),
        }
    }

    /// Dispatch one inbound packet.
    pub async fn handle(&self, peer: &Arc<Peer>, packet: Packet) -> SyncResult<()> {
        let id = peer.id();
        self.metrics.handler.packets_in.inc();
        trace!(peer = %id, packet = packet.name(), "Inbound packet");

        match packet {
            Packet::Status { .. } => Err(SyncError::protocol(id, "status after handshake")),
            Packet::BlockHeaders(headers) => self.on_headers(id, headers).await,
            Packet::BlockBodies(bodies) => {
                let expecting = self.downloader.is_expecting(id, RequestKind::Bodies);
                let bodies = self
                    .block_fetcher
                    .filter_bodies(id, bodies, Instant::now(), expecting)
                    .await;
                if expecting || !bodies.is_empty() {
                    self.delivered(id, self.downloader.deliver_bodies(id, bodies));
                }
                Ok(())
            }
            Packet::Receipts(receipts) => {
                self.delivered(id, self.downloader.deliver_receipts(id, receipts));
                Ok(())
            }
            Packet::NodeData(data) => {
                self.delivered(id, self.downloader.deliver_node_data(id, data));
                Ok(())
            }
            Packet::NewBlockHashes(entries) => {
                self.on_block_hashes(peer, entries).await;
                Ok(())
            }
            Packet::NewBlock { block, td } => self.on_block(peer, *block, td).await,
            Packet::NewPooledTransactionHashes(hashes) => {
                if !self.flags.accepts_txs() {
                    trace!(peer = %id, count = hashes.len(), "Ignoring transaction announcement");
                    return Ok(());
                }
                if let Err(err) = self
                    .tx_fetcher
                    .notify(id, hashes, tx_requester(peer))
                    .await
                {
                    debug!(peer = %id, error = %err, "Transaction announcement dropped");
                }
                Ok(())
            }
            Packet::Transactions(txs) | Packet::PooledTransactions(txs)
                if !self.flags.accepts_txs() =>
            {
                trace!(peer = %id, count = txs.len(), "Ignoring transactions");
                Ok(())
            }
            Packet::Transactions(txs) => {
                self.enqueue_txs(id, txs, false).await;
                Ok(())
            }
            Packet::PooledTransactions(txs) => {
                self.enqueue_txs(id, txs, true).await;
                Ok(())
            }
        }
    }

    async fn on_headers(&self, id: &PeerId, headers: Vec<Header>) -> SyncResult<()> {
        if headers.is_empty() && self.challenges.remove(id).is_some() && self.flags.is_fast_sync()
        {
            self.metrics.handler.challenges_failed.inc();
            return Err(SyncError::UnsyncedPeer(id.clone()));
        }

        let filter = headers.len() == 1;
        let mut headers = headers;
        if let [header] = headers.as_slice() {
            let number = header.number;
            let hash = header.hash();
            if let Some(checkpoint) = self.config.checkpoint {
                if number == checkpoint.number && self.challenges.remove(id).is_some() {
                    if hash != checkpoint.hash {
                        self.metrics.handler.challenges_failed.inc();
                        return Err(SyncError::UntrustedCheckpointMismatch {
                            peer: id.clone(),
                            number,
                        });
                    }
                    debug!(peer = %id, number, "Checkpoint challenge passed");
                    return Ok(());
                }
            }
            if let Some(want) = self.config.whitelist.get(&number) {
                if *want != hash {
                    return Err(SyncError::WhitelistMismatch {
                        peer: id.clone(),
                        number,
                    });
                }
            }
            headers = self
                .block_fetcher
                .filter_headers(id, headers, Instant::now())
                .await;
        }

        if !headers.is_empty() || !filter {
            self.delivered(id, self.downloader.deliver_headers(id, headers));
        }
        Ok(())
    }

    async fn on_block_hashes(&self, peer: &Arc<Peer>, entries: Vec<(H256, u64)>) {
        let id = peer.id();
        for (hash, number) in entries {
            if self.chain.has_block(&hash, number) {
                continue;
            }
            let announce = BlockAnnounce {
                peer: id.clone(),
                hash,
                number,
                time: Instant::now(),
                fetch_header: header_requester(peer),
                fetch_bodies: body_requester(peer),
            };
            if let Err(err) = self.block_fetcher.notify(announce).await {
                debug!(peer = %id, error = %err, "Block announcement dropped");
                return;
            }
        }
    }

    async fn on_block(
        &self,
        peer: &Arc<Peer>,
        block: Block,
        td: TotalDifficulty,
    ) -> SyncResult<()> {
        let id = peer.id();
        let difficulty = block.header.difficulty;
        if td < difficulty {
            return Err(SyncError::protocol(
                id,
                format!("total difficulty {td} below block difficulty {difficulty}"),
            ));
        }
        let parent = block.header.parent_hash;
        let number = block.number();
        if let Err(err) = self.block_fetcher.enqueue(id, block).await {
            debug!(peer = %id, number, error = %err, "Propagated block dropped");
        }

        // The peer is at least at the parent; the block itself may not be
        // valid yet.
        let parent_td = td - difficulty;
        if parent_td > peer.td() {
            peer.set_head(parent, parent_td);
            trace!(peer = %id, td = parent_td, "Peer head advanced by propagated block");
            self.chain_sync.peer_event(id).await;
        }
        Ok(())
    }

    async fn enqueue_txs(&self, id: &PeerId, txs: Vec<Transaction>, direct: bool) {
        if let Err(err) = self.tx_fetcher.enqueue(id, txs, direct).await {
            debug!(peer = %id, error = %err, "Transactions dropped");
        }
    }

    fn delivered(&self, id: &PeerId, result: SyncResult<()>) {
        if let Err(err) = result {
            debug!(peer = %id, error = %err, "Delivery not accepted");
        }
    }
}

fn header_requester(peer: &Arc<Peer>) -> HeaderRequester {
    let peer = Arc::clone(peer);
    Arc::new(move |hash: H256| peer.request_headers_by_hash(hash, 1, 0, false))
}

fn body_requester(peer: &Arc<Peer>) -> BodyRequester {
    let peer = Arc::clone(peer);
    Arc::new(move |hashes: Vec<H256>| peer.request_bodies(hashes))
}

fn tx_requester(peer: &Arc<Peer>) -> TxRequester {
    let peer = Arc::clone(peer);
    Arc::new(move |hashes: Vec<H256>| peer.request_pooled_transactions(hashes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainsync::ChainSyncer;
    use crate::config::{BlockFetcherConfig, ChainSyncConfig, Checkpoint, TxFetcherConfig};
    use crate::test_support::{peer_id, small_config, Fixture, ServingTransport, TestChain};
    use avn_chain::BasicEngine;
    use avn_mempool::{Mempool, TxPool};
    use avn_network::{Capability, NetworkError, PeerHead, PeerTransport};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        chain: TestChain,
        fixture: Fixture,
        pool: Arc<Mempool>,
        flags: Arc<SyncFlags>,
        handler: Handler,
        _syncer: ChainSyncer,
        _shutdown: tokio_util::sync::DropGuard,
    }

    fn harness(config: HandlerConfig, fast_sync: bool, local_height: u64) -> Harness {
        let chain = TestChain::new(10);
        let fixture = Fixture::new(chain.store_upto(local_height), small_config());
        let local = Arc::clone(&fixture.local) as Arc<dyn ChainStore>;
        let flags = Arc::new(SyncFlags::new(fast_sync));
        let pool = Arc::new(Mempool::with_defaults());
        let shutdown = CancellationToken::new();

        let (block_fetcher, task) = BlockFetcher::new(
            BlockFetcherConfig::default(),
            Arc::clone(&local),
            Arc::new(BasicEngine),
            Arc::clone(&fixture.peers),
            Arc::clone(&fixture.metrics),
            Arc::new(parking_lot::Mutex::new(())),
            Arc::clone(&flags),
        );
        tokio::spawn(task.run(shutdown.clone()));
        let (tx_fetcher, task) = TxFetcher::new(
            TxFetcherConfig::default(),
            Arc::clone(&pool) as Arc<dyn TxPool>,
            Arc::clone(&fixture.metrics),
        );
        tokio::spawn(task.run(shutdown.clone()));
        // Not running: events only fill its queue.
        let (syncer, chain_sync) = ChainSyncer::new(
            ChainSyncConfig::default(),
            Arc::clone(&local),
            Arc::clone(&fixture.peers),
            Arc::clone(&fixture.downloader),
            Arc::clone(&flags),
        );

        let handler = Handler::new(
            config,
            local,
            Arc::clone(&fixture.peers),
            Arc::clone(&fixture.downloader),
            block_fetcher,
            tx_fetcher,
            chain_sync,
            Arc::clone(&flags),
            Arc::clone(&fixture.metrics),
        );
        Harness {
            chain,
            fixture,
            pool,
            flags,
            handler,
            _syncer: syncer,
            _shutdown: shutdown.drop_guard(),
        }
    }

    fn connect(n: u8, chain: &TestChain) -> (Arc<Peer>, Arc<ServingTransport>) {
        let transport = Arc::new(ServingTransport::new(peer_id(n), chain.store()));
        let peer = Peer::new(
            peer_id(n),
            avn_network::PROTOCOL_VERSION,
            [Capability::Eth],
            PeerHead {
                hash: chain.blocks[1].hash(),
                td: 2,
            },
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        );
        (Arc::new(peer), transport)
    }

    async fn run_with(h: &Harness, peer: Arc<Peer>, packets: Vec<Packet>) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel(16);
        for packet in packets {
            tx.send(packet).await.unwrap();
        }
        drop(tx);
        h.handler.run_peer(peer, rx).await
    }

    fn checkpoint_config(chain: &TestChain, hash: Option<H256>) -> HandlerConfig {
        HandlerConfig {
            checkpoint: Some(Checkpoint {
                number: 5,
                hash: hash.unwrap_or_else(|| chain.blocks[5].hash()),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_exit_unregisters() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (peer, transport) = connect(1, &h.chain);

        run_with(&h, peer, Vec::new()).await.unwrap();

        assert!(!h.fixture.peers.contains(&peer_id(1)));
        assert!(transport.disconnected.lock().is_none());
        // No challenge without fast sync.
        assert!(transport.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_second_status_is_violation() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (peer, transport) = connect(1, &h.chain);
        let status = Packet::Status {
            version: avn_network::PROTOCOL_VERSION,
            td: 1,
            head: H256::ZERO,
            genesis: h.chain.blocks[0].hash(),
        };

        let err = run_with(&h, peer, vec![status]).await.unwrap_err();

        assert!(matches!(err, SyncError::PeerProtocolViolation { .. }));
        assert_eq!(
            *transport.disconnected.lock(),
            Some(DisconnectReason::ProtocolViolation)
        );
        assert!(!h.fixture.peers.contains(&peer_id(1)));
        assert_eq!(h.fixture.metrics.handler.peers_dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (first, _) = connect(1, &h.chain);
        h.fixture.peers.register(first).unwrap();
        let (second, transport) = connect(1, &h.chain);

        let err = run_with(&h, second, Vec::new()).await.unwrap_err();

        assert_eq!(
            err,
            SyncError::Network(NetworkError::DuplicatePeer(peer_id(1)))
        );
        assert_eq!(
            *transport.disconnected.lock(),
            Some(DisconnectReason::AlreadyConnected)
        );
        assert!(h.fixture.peers.contains(&peer_id(1)));
    }

    #[tokio::test]
    async fn test_checkpoint_mismatch_drops_peer() {
        let chain = TestChain::new(10);
        let wrong = chain.blocks[4].hash();
        let h = harness(checkpoint_config(&chain, Some(wrong)), true, 0);
        let (peer, transport) = connect(1, &h.chain);
        let reply = Packet::BlockHeaders(vec![h.chain.blocks[5].header.clone()]);

        let err = run_with(&h, peer, vec![reply]).await.unwrap_err();

        assert_eq!(
            err,
            SyncError::UntrustedCheckpointMismatch {
                peer: peer_id(1),
                number: 5
            }
        );
        assert_eq!(transport.requests_of(RequestKind::Headers), 1);
        assert_eq!(
            *transport.disconnected.lock(),
            Some(DisconnectReason::CheckpointMismatch)
        );
        assert_eq!(h.fixture.local.current_header().number, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_match_keeps_peer() {
        let chain = TestChain::new(10);
        let h = harness(checkpoint_config(&chain, None), true, 0);
        let (peer, transport) = connect(1, &h.chain);
        let reply = Packet::BlockHeaders(vec![h.chain.blocks[5].header.clone()]);

        run_with(&h, peer, vec![reply]).await.unwrap();

        assert!(transport.disconnected.lock().is_none());
        assert_eq!(h.fixture.metrics.handler.challenges_sent.get(), 1);
        assert_eq!(h.fixture.metrics.handler.challenges_failed.get(), 0);
        // The challenge reply is consumed, not delivered.
        assert_eq!(h.fixture.metrics.downloader.headers.dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_empty_challenge_reply_is_unsynced() {
        let chain = TestChain::new(10);
        let h = harness(checkpoint_config(&chain, None), true, 0);
        let (peer, transport) = connect(1, &h.chain);

        let err = run_with(&h, peer, vec![Packet::BlockHeaders(Vec::new())])
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::UnsyncedPeer(peer_id(1)));
        assert_eq!(*transport.disconnected.lock(), Some(DisconnectReason::Unsynced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_challenge_times_out() {
        let chain = TestChain::new(10);
        let h = harness(checkpoint_config(&chain, None), true, 0);
        let (peer, transport) = connect(1, &h.chain);
        let (_tx, rx) = mpsc::channel(1);

        let started = Instant::now();
        let err = h.handler.run_peer(peer, rx).await.unwrap_err();

        assert_eq!(err, SyncError::PeerUnresponsive(peer_id(1)));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(
            *transport.disconnected.lock(),
            Some(DisconnectReason::Unresponsive)
        );
    }

    #[tokio::test]
    async fn test_whitelist_mismatch_drops_peer() {
        let chain = TestChain::new(10);
        let config = HandlerConfig {
            whitelist: HashMap::from([(3, chain.blocks[2].hash())]),
            ..Default::default()
        };
        let h = harness(config, false, 0);
        let (peer, transport) = connect(1, &h.chain);
        let reply = Packet::BlockHeaders(vec![h.chain.blocks[3].header.clone()]);

        let err = run_with(&h, peer, vec![reply]).await.unwrap_err();

        assert!(matches!(err, SyncError::WhitelistMismatch { number: 3, .. }));
        assert_eq!(
            *transport.disconnected.lock(),
            Some(DisconnectReason::WhitelistMismatch)
        );
    }

    #[tokio::test]
    async fn test_new_block_below_own_difficulty_is_violation() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (peer, _) = connect(1, &h.chain);
        let mut block = h.chain.blocks[1].clone();
        block.header.difficulty = 10;
        let packet = Packet::NewBlock {
            block: Box::new(block),
            td: 5,
        };

        let err = h.handler.handle(&peer, packet).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_new_block_imported_and_peer_head_advanced() {
        let h = harness(HandlerConfig::default(), false, 5);
        let (peer, _) = connect(1, &h.chain);
        let block = h.chain.blocks[6].clone();
        let parent = block.header.parent_hash;
        let td = h.chain.truncated(6).td();

        h.handler
            .handle(
                &peer,
                Packet::NewBlock {
                    block: Box::new(block.clone()),
                    td,
                },
            )
            .await
            .unwrap();
        h.handler.block_fetcher.stats().await.unwrap();

        assert_eq!(h.fixture.local.current_block().hash(), block.hash());
        assert_eq!(peer.head().hash, parent);
        assert_eq!(peer.td(), td - block.header.difficulty);
    }

    #[tokio::test]
    async fn test_unknown_block_hashes_announced() {
        let h = harness(HandlerConfig::default(), false, 5);
        let (peer, _) = connect(1, &h.chain);
        let entries = vec![
            (h.chain.blocks[4].hash(), 4),
            (h.chain.blocks[6].hash(), 6),
            (h.chain.blocks[7].hash(), 7),
        ];

        h.handler
            .handle(&peer, Packet::NewBlockHashes(entries))
            .await
            .unwrap();

        let stats = h.handler.block_fetcher.stats().await.unwrap();
        assert_eq!(stats.announced, 2);
    }

    #[tokio::test]
    async fn test_transactions_only_after_acceptance() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (peer, _) = connect(1, &h.chain);
        let txs = vec![Transaction::new(1, vec![1u8; 4]), Transaction::new(2, vec![2u8; 4])];

        h.handler
            .handle(&peer, Packet::Transactions(txs.clone()))
            .await
            .unwrap();
        h.handler.tx_fetcher.stats().await.unwrap();
        assert!(h.pool.is_empty());

        h.flags.enable_txs();
        h.handler
            .handle(&peer, Packet::Transactions(txs))
            .await
            .unwrap();
        h.handler.tx_fetcher.stats().await.unwrap();
        assert_eq!(h.pool.len(), 2);
    }

    #[tokio::test]
    async fn test_unsolicited_receipts_are_tolerated() {
        let h = harness(HandlerConfig::default(), false, 0);
        let (peer, _) = connect(1, &h.chain);

        h.handler
            .handle(&peer, Packet::Receipts(vec![Vec::new()]))
            .await
            .unwrap();

        assert_eq!(h.fixture.metrics.downloader.receipts.dropped.get(), 1);
    }
}
