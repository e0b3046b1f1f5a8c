//! Node implementation.

use crate::config::{GenesisConfig, NodeConfig};
use anyhow::{Context, Result};
use avn_chain::{
    empty_root, BasicEngine, Block, Body, ChainStore, Header, MemoryChain, StateNode, H256,
};
use avn_mempool::{Mempool, TxPool};
use avn_sync::{SyncMetrics, SyncService, SyncStatus};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build the genesis block and its state from configuration.
pub fn genesis_block(config: &GenesisConfig) -> Result<(Block, Vec<StateNode>)> {
    let extra = hex::decode(&config.extra).context("genesis extra is not valid hex")?;
    let state = StateNode::leaf(config.state.clone().into_bytes());
    let header = Header {
        number: 0,
        parent_hash: H256::ZERO,
        state_root: state.hash(),
        tx_root: empty_root(),
        uncle_hash: empty_root(),
        receipt_root: empty_root(),
        difficulty: config.difficulty,
        timestamp: config.timestamp,
        extra: Bytes::from(extra),
    };
    Ok((Block::new(header, Body::default()), vec![state]))
}

/// The main node struct coordinating all components.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,
    /// Chain storage.
    chain: Arc<MemoryChain>,
    /// Transaction mempool.
    mempool: Arc<Mempool>,
    /// Sync subsystem.
    sync: SyncService,
}

impl Node {
    /// Create a new node.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let (genesis, state) = genesis_block(&config.genesis)?;
        info!(hash = %genesis.hash(), "Initialized genesis block");
        let chain = Arc::new(MemoryChain::new(genesis, state));
        let mempool = Arc::new(Mempool::new(config.mempool_config()));
        let metrics = Arc::new(SyncMetrics::new());

        let sync = SyncService::new(
            config.sync_config()?,
            Arc::clone(&chain) as Arc<dyn ChainStore>,
            Arc::new(BasicEngine),
            Arc::clone(&mempool) as Arc<dyn TxPool>,
            metrics,
        );

        Ok(Self {
            config,
            chain,
            mempool,
            sync,
        })
    }

    pub fn chain(&self) -> &Arc<MemoryChain> {
        &self.chain
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    /// Run until `shutdown` is canceled, logging progress periodically.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(name = %self.config.node_name, "Node starting");
        let handles = self.sync.start(shutdown.clone());

        let period = Duration::from_secs(self.config.sync.progress_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.log_progress(),
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
        info!(head = self.chain.current_block().number, "Node stopped");
        Ok(())
    }

    fn log_progress(&self) {
        let status = self.sync.status();
        let head = self.chain.current_block();
        let peers = self.sync.peers().len();
        if status == SyncStatus::Idle {
            debug!(
                number = head.number,
                hash = %head.hash().short(),
                peers,
                mempool = self.mempool.len(),
                "Chain head"
            );
            return;
        }

        let progress = self.sync.progress();
        let metrics = self.sync.metrics();
        info!(
            ?status,
            current = progress.current_block,
            highest = progress.highest_block,
            states = progress.pulled_states,
            peers,
            headers = metrics.downloader.headers.items_in.get(),
            bodies = metrics.downloader.bodies.items_in.get(),
            "Sync progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_deterministic() {
        let config = GenesisConfig::default();
        let (a, state) = genesis_block(&config).unwrap();
        let (b, _) = genesis_block(&config).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.header.state_root, state[0].hash());

        let other = GenesisConfig {
            extra: "abcd".to_string(),
            ..Default::default()
        };
        let (c, _) = genesis_block(&other).unwrap();
        assert_ne!(a.hash(), c.hash());
        assert_eq!(&c.header.extra[..], &[0xabu8, 0xcd]);
    }

    #[test]
    fn test_node_starts_at_genesis() {
        let config = NodeConfig::default();
        let node = Node::new(config.clone()).unwrap();

        let (genesis, _) = genesis_block(&config.genesis).unwrap();
        assert_eq!(node.chain().current_block().hash(), genesis.hash());
        assert_eq!(node.sync().status(), SyncStatus::Idle);
        assert!(!node.sync().flags().accepts_txs());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut node = Node::new(NodeConfig::default()).unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        node.run(shutdown).await.unwrap();
        assert_eq!(node.chain().current_block().number, 0);
    }
}
