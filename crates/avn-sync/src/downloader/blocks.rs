//! Body and receipt download, and block commit.

use super::fetch::FetchJob;
use super::queue::FetchQueue;
use super::router::Delivery;
use super::{Downloader, SyncStatus, SyncTarget};
use crate::context::OpContext;
use crate::{SyncError, SyncResult};
use avn_chain::{receipts_root, Block, Body, ChainError, Header, Receipt, H256};
use avn_network::{NetworkResult, Peer, PeerId, RequestKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

impl Downloader {
    /// Fetch bodies (and receipts in fast mode) for the committed headers
    /// in `hashes` and commit them chunk by chunk.
    ///
    /// Blocks below `pivot` are stored with receipts only, the pivot gets
    /// its state synced and is promoted, everything above it is imported
    /// fully. Without a pivot every block is imported fully.
    pub(super) async fn fetch_blocks(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        hashes: &[H256],
        pivot: Option<u64>,
    ) -> SyncResult<()> {
        let chunk_size = self.config.block_chunk_size.max(1) as usize;
        for chunk in hashes.chunks(chunk_size) {
            ctx.check()?;
            let headers = chunk
                .iter()
                .map(|hash| {
                    self.chain
                        .header_by_hash(hash)
                        .ok_or(ChainError::UnknownHeader(*hash))
                })
                .collect::<Result<Vec<_>, _>>()?;

            self.set_status(SyncStatus::FetchingBodies);
            let bodies = self.fetch_bodies(ctx, target, &headers).await?;
            let mut blocks: Vec<Block> = headers
                .into_iter()
                .zip(bodies)
                .map(|(header, body)| Block::new(header, body))
                .collect();

            if let Some(pivot) = pivot {
                let split = blocks.partition_point(|b| b.number() <= pivot);
                let full = blocks.split_off(split);
                if !blocks.is_empty() {
                    self.set_status(SyncStatus::FetchingReceipts);
                    let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();
                    let receipts = self.fetch_receipts(ctx, target, &headers).await?;
                    self.commit_fast(ctx, target, blocks, receipts, pivot).await?;
                }
                blocks = full;
            }
            if !blocks.is_empty() {
                self.commit_full(blocks)?;
            }
        }
        Ok(())
    }

    async fn fetch_bodies(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        headers: &[Header],
    ) -> SyncResult<Vec<Body>> {
        let job = BodyJob {
            downloader: self,
            headers: headers.iter().map(|h| (h.number, h)).collect(),
            results: Mutex::new(BTreeMap::new()),
        };
        let queue = FetchQueue::new(self.config.max_retries);
        queue.queue(
            headers
                .iter()
                .filter(|h| !h.has_empty_body())
                .map(|h| h.number),
        );
        self.run_fetch(ctx, &job, &queue, &target.peer).await?;

        let mut results = job.results.into_inner();
        Ok(headers
            .iter()
            .map(|h| results.remove(&h.number).unwrap_or_default())
            .collect())
    }

    async fn fetch_receipts(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        headers: &[Header],
    ) -> SyncResult<Vec<Vec<Receipt>>> {
        let job = ReceiptJob {
            downloader: self,
            headers: headers.iter().map(|h| (h.number, h)).collect(),
            results: Mutex::new(BTreeMap::new()),
        };
        let queue = FetchQueue::new(self.config.max_retries);
        queue.queue(
            headers
                .iter()
                .filter(|h| !h.has_empty_receipts())
                .map(|h| h.number),
        );
        self.run_fetch(ctx, &job, &queue, &target.peer).await?;

        let mut results = job.results.into_inner();
        Ok(headers
            .iter()
            .map(|h| results.remove(&h.number).unwrap_or_default())
            .collect())
    }

    /// Store blocks up to and including the pivot without execution.
    async fn commit_fast(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        mut blocks: Vec<Block>,
        mut receipts: Vec<Vec<Receipt>>,
        pivot: u64,
    ) -> SyncResult<()> {
        let pivot_block = if blocks.last().is_some_and(|b| b.number() == pivot) {
            blocks.pop().zip(receipts.pop())
        } else {
            None
        };

        if !blocks.is_empty() {
            self.set_status(SyncStatus::Committing);
            let last = blocks.last().map_or(0, Block::number);
            let count = {
                let _guard = self.chain_lock.lock();
                self.chain.insert_receipt_chain(blocks, receipts)?
            };
            self.progress.write().current_block = last;
            debug!(count, last, "Committed receipt chain");
        }

        if let Some((block, receipts)) = pivot_block {
            let hash = block.hash();
            let root = block.header.state_root;
            {
                let _guard = self.chain_lock.lock();
                self.chain.insert_receipt_chain(vec![block], vec![receipts])?;
            }
            self.set_status(SyncStatus::FetchingState);
            self.sync_state(ctx, target, root).await?;
            self.set_status(SyncStatus::Committing);
            {
                let _guard = self.chain_lock.lock();
                self.chain.commit_pivot(&hash)?;
            }
            self.progress.write().current_block = pivot;
            info!(number = pivot, hash = %hash.short(), "Fast sync pivot committed");
        }
        Ok(())
    }

    /// Import blocks with full execution.
    fn commit_full(&self, blocks: Vec<Block>) -> SyncResult<()> {
        self.set_status(SyncStatus::Committing);
        let last = blocks.last().map_or(0, Block::number);
        let count = {
            let _guard = self.chain_lock.lock();
            self.chain.insert_bodies(blocks)?
        };
        self.progress.write().current_block = last;
        debug!(count, last, "Imported blocks");
        Ok(())
    }
}

/// Bodies for a chunk of headers, matched by position.
struct BodyJob<'a> {
    downloader: &'a Downloader,
    headers: HashMap<u64, &'a Header>,
    results: Mutex<BTreeMap<u64, Body>>,
}

impl FetchJob for BodyJob<'_> {
    type Key = u64;

    fn kind(&self) -> RequestKind {
        RequestKind::Bodies
    }

    fn batch_limit(&self, peer: &Peer) -> usize {
        let config = &self.downloader.config;
        peer.rate(RequestKind::Bodies)
            .capacity(config.target_rtt, config.max_body_fetch)
    }

    fn send(&self, peer: &Peer, keys: &[u64]) -> NetworkResult<()> {
        let hashes = keys
            .iter()
            .filter_map(|n| self.headers.get(n).map(|h| h.hash()))
            .collect();
        peer.request_bodies(hashes)
    }

    fn accept(
        &self,
        peer: &PeerId,
        keys: &[u64],
        delivery: Delivery,
        _queue: &FetchQueue<u64>,
    ) -> SyncResult<Vec<u64>> {
        let Delivery::Bodies(bodies) = delivery else {
            return Ok(Vec::new());
        };
        if bodies.len() > keys.len() {
            return Err(SyncError::protocol(
                peer,
                format!("{} bodies for {} requested", bodies.len(), keys.len()),
            ));
        }
        let mut accepted = Vec::with_capacity(bodies.len());
        let mut results = self.results.lock();
        for (&number, body) in keys.iter().zip(bodies) {
            let Some(header) = self.headers.get(&number) else {
                continue;
            };
            if !body.matches(header) {
                self.downloader.metrics.downloader.bodies.dropped.inc();
                return Err(SyncError::BodyHeaderMismatch {
                    peer: peer.clone(),
                    number,
                });
            }
            results.insert(number, body);
            accepted.push(number);
        }
        Ok(accepted)
    }
}

/// Receipts for a chunk of headers, matched by position.
struct ReceiptJob<'a> {
    downloader: &'a Downloader,
    headers: HashMap<u64, &'a Header>,
    results: Mutex<BTreeMap<u64, Vec<Receipt>>>,
}

impl FetchJob for ReceiptJob<'_> {
    type Key = u64;

    fn kind(&self) -> RequestKind {
        RequestKind::Receipts
    }

    fn batch_limit(&self, peer: &Peer) -> usize {
        let config = &self.downloader.config;
        peer.rate(RequestKind::Receipts)
            .capacity(config.target_rtt, config.max_receipt_fetch)
    }

    fn send(&self, peer: &Peer, keys: &[u64]) -> NetworkResult<()> {
        let hashes = keys
            .iter()
            .filter_map(|n| self.headers.get(n).map(|h| h.hash()))
            .collect();
        peer.request_receipts(hashes)
    }

    fn accept(
        &self,
        peer: &PeerId,
        keys: &[u64],
        delivery: Delivery,
        _queue: &FetchQueue<u64>,
    ) -> SyncResult<Vec<u64>> {
        let Delivery::Receipts(lists) = delivery else {
            return Ok(Vec::new());
        };
        if lists.len() > keys.len() {
            return Err(SyncError::protocol(
                peer,
                format!("{} receipt lists for {} requested", lists.len(), keys.len()),
            ));
        }
        let mut accepted = Vec::with_capacity(lists.len());
        let mut results = self.results.lock();
        for (&number, receipts) in keys.iter().zip(lists) {
            let Some(header) = self.headers.get(&number) else {
                continue;
            };
            if receipts_root(&receipts) != header.receipt_root {
                self.downloader.metrics.downloader.receipts.dropped.inc();
                return Err(SyncError::ReceiptHeaderMismatch {
                    peer: peer.clone(),
                    number,
                });
            }
            results.insert(number, receipts);
            accepted.push(number);
        }
        Ok(accepted)
    }
}
