//! Pivot state download.

use super::fetch::FetchJob;
use super::queue::FetchQueue;
use super::router::Delivery;
use super::{Downloader, SyncTarget};
use crate::context::OpContext;
use crate::{SyncError, SyncResult};
use avn_chain::{blake2b256, StateNode, H256};
use avn_network::{NetworkResult, Peer, PeerId, RequestKind};
use std::collections::HashSet;
use tracing::{debug, info};

impl Downloader {
    /// Download every state entry reachable from `root` that is not stored
    /// locally yet.
    pub(super) async fn sync_state(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        root: H256,
    ) -> SyncResult<()> {
        let missing = self.missing_state(root)?;
        if missing.is_empty() {
            debug!(root = %root.short(), "Pivot state already present");
            return Ok(());
        }
        info!(root = %root.short(), "Syncing pivot state");

        let queue = FetchQueue::new(self.config.max_retries);
        let known = queue.queue(missing) as u64;
        {
            let mut progress = self.progress.write();
            progress.known_states += known;
        }
        let job = StateJob { downloader: self };
        self.run_fetch(ctx, &job, &queue, &target.peer).await?;

        let progress = self.progress();
        info!(
            root = %root.short(),
            pulled = progress.pulled_states,
            "Pivot state synced"
        );
        Ok(())
    }

    /// Frontier of missing entries below `root`, walking what is stored.
    fn missing_state(&self, root: H256) -> SyncResult<Vec<H256>> {
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            if !self.chain.has_state_node(&hash) {
                missing.push(hash);
                continue;
            }
            if let Some(data) = self.chain.state_node(&hash) {
                stack.extend(StateNode::decode(&data)?.children);
            }
        }
        Ok(missing)
    }
}

/// Trie entries by hash. Children of every delivered entry are queued.
struct StateJob<'a> {
    downloader: &'a Downloader,
}

impl FetchJob for StateJob<'_> {
    type Key = H256;

    fn kind(&self) -> RequestKind {
        RequestKind::State
    }

    fn batch_limit(&self, peer: &Peer) -> usize {
        let config = &self.downloader.config;
        peer.rate(RequestKind::State)
            .capacity(config.target_rtt, config.max_state_fetch)
    }

    fn send(&self, peer: &Peer, keys: &[H256]) -> NetworkResult<()> {
        peer.request_node_data(keys.to_vec())
    }

    fn accept(
        &self,
        peer: &PeerId,
        keys: &[H256],
        delivery: Delivery,
        queue: &FetchQueue<H256>,
    ) -> SyncResult<Vec<H256>> {
        let Delivery::NodeData(blobs) = delivery else {
            return Ok(Vec::new());
        };
        let metrics = &self.downloader.metrics.downloader.state;
        let chain = &self.downloader.chain;
        let mut requested: HashSet<&H256> = keys.iter().collect();
        let mut delivered = Vec::with_capacity(blobs.len());
        let mut discovered = 0u64;

        for blob in blobs {
            let hash = blake2b256(&blob);
            if !requested.remove(&hash) {
                metrics.dropped.inc();
                continue;
            }
            let node = StateNode::decode(&blob)
                .map_err(|e| SyncError::protocol(peer, format!("bad state entry: {e}")))?;
            chain.write_state_node(hash, blob)?;
            let children = node
                .children
                .into_iter()
                .filter(|child| !chain.has_state_node(child));
            discovered += queue.queue(children) as u64;
            delivered.push(hash);
        }

        let mut progress = self.downloader.progress.write();
        progress.pulled_states += delivered.len() as u64;
        progress.known_states += discovered;
        Ok(delivered)
    }
}
