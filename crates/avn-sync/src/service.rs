//! Wiring of the sync components for a node.

use crate::chainsync::ChainSyncer;
use crate::config::{SyncConfig, SyncMode};
use crate::downloader::{Downloader, SyncProgress, SyncStatus};
use crate::fetcher::{BlockFetcher, BlockFetcherTask, TxFetcher, TxFetcherTask};
use crate::flags::SyncFlags;
use crate::handler::Handler;
use crate::metrics::SyncMetrics;
use avn_chain::{ChainStore, Engine};
use avn_mempool::TxPool;
use avn_network::PeerSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Background tasks, present until `start` spawns them.
struct Tasks {
    block_fetcher: BlockFetcherTask,
    tx_fetcher: TxFetcherTask,
    chain_syncer: ChainSyncer,
}

/// The sync subsystem of a node: peer registry, downloader, fetchers,
/// sync controller and the protocol handler that ties them to connections.
pub struct SyncService {
    chain: Arc<dyn ChainStore>,
    peers: Arc<PeerSet>,
    downloader: Arc<Downloader>,
    handler: Arc<Handler>,
    flags: Arc<SyncFlags>,
    metrics: Arc<SyncMetrics>,
    tasks: Option<Tasks>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn ChainStore>,
        engine: Arc<dyn Engine>,
        pool: Arc<dyn TxPool>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let head = chain.current_block().number;
        let fast_sync = config.mode == SyncMode::Fast && head == 0;
        if config.mode == SyncMode::Fast && !fast_sync {
            warn!(head, "Chain not empty, fast sync disabled");
        }
        let flags = Arc::new(SyncFlags::new(fast_sync));
        let peers = Arc::new(PeerSet::new());
        let chain_lock = Arc::new(Mutex::new(()));

        let downloader = Arc::new(Downloader::new(
            config.downloader,
            Arc::clone(&chain),
            Arc::clone(&engine),
            Arc::clone(&peers),
            Arc::clone(&metrics),
            Arc::clone(&chain_lock),
        ));
        let (block_fetcher, block_task) = BlockFetcher::new(
            config.block_fetcher,
            Arc::clone(&chain),
            engine,
            Arc::clone(&peers),
            Arc::clone(&metrics),
            chain_lock,
            Arc::clone(&flags),
        );
        let (tx_fetcher, tx_task) =
            TxFetcher::new(config.tx_fetcher, pool, Arc::clone(&metrics));
        let (chain_syncer, chain_sync) = ChainSyncer::new(
            config.chain_sync,
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&downloader),
            Arc::clone(&flags),
        );
        let handler = Arc::new(Handler::new(
            config.handler,
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&downloader),
            block_fetcher,
            tx_fetcher,
            chain_sync,
            Arc::clone(&flags),
            Arc::clone(&metrics),
        ));

        Self {
            chain,
            peers,
            downloader,
            handler,
            flags,
            metrics,
            tasks: Some(Tasks {
                block_fetcher: block_task,
                tx_fetcher: tx_task,
                chain_syncer,
            }),
        }
    }

    /// Spawn the fetchers and the sync controller. They stop when
    /// `shutdown` is canceled. Calling this twice spawns nothing.
    pub fn start(&mut self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(tasks) = self.tasks.take() else {
            warn!("Sync service already started");
            return Vec::new();
        };
        info!(
            head = self.chain.current_block().number,
            fast_sync = self.flags.is_fast_sync(),
            "Starting sync service"
        );
        vec![
            tokio::spawn(tasks.block_fetcher.run(shutdown.clone())),
            tokio::spawn(tasks.tx_fetcher.run(shutdown.clone())),
            tokio::spawn(tasks.chain_syncer.run(shutdown)),
        ]
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// Handler to run each connection through.
    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn flags(&self) -> &Arc<SyncFlags> {
        &self.flags
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn status(&self) -> SyncStatus {
        self.downloader.status()
    }

    pub fn progress(&self) -> SyncProgress {
        self.downloader.progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestChain;
    use avn_chain::BasicEngine;
    use avn_mempool::Mempool;

    fn service(mode: SyncMode, height: u64) -> SyncService {
        let chain = TestChain::new(5).store_upto(height);
        SyncService::new(
            SyncConfig {
                mode,
                ..Default::default()
            },
            chain,
            Arc::new(BasicEngine),
            Arc::new(Mempool::with_defaults()),
            Arc::new(SyncMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_fast_sync_only_on_empty_chain() {
        assert!(service(SyncMode::Fast, 0).flags().is_fast_sync());
        assert!(!service(SyncMode::Fast, 3).flags().is_fast_sync());
        assert!(!service(SyncMode::Full, 0).flags().is_fast_sync());
    }

    #[tokio::test]
    async fn test_start_spawns_once() {
        let mut service = service(SyncMode::Full, 0);
        let shutdown = CancellationToken::new();

        let handles = service.start(shutdown.clone());
        assert_eq!(handles.len(), 3);
        assert!(service.start(shutdown.clone()).is_empty());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(service.status(), SyncStatus::Idle);
    }
}
