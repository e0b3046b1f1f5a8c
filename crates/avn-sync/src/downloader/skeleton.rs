//! Header download: skeleton from the master, gaps filled concurrently.

use super::ancestor::Origin;
use super::fetch::FetchJob;
use super::headers::{HeaderBatch, HeaderQueue};
use super::queue::FetchQueue;
use super::router::Delivery;
use super::{Downloader, SyncTarget};
use crate::context::OpContext;
use crate::{SyncError, SyncResult};
use avn_chain::Header;
use avn_network::{NetworkResult, Peer, PeerId, PenaltyReason, RequestKind};
use parking_lot::Mutex;
use tracing::{debug, warn};

impl Downloader {
    /// Download and commit every header between `ancestor` and `remote`.
    ///
    /// While more than one stride remains, the master serves a skeleton of
    /// every `max_header_fetch`-th header and the gaps below each anchor are
    /// filled by any idle peer. The tail is fetched densely from the master.
    /// Batches are committed strictly in order.
    pub(super) async fn fetch_headers(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        ancestor: &Header,
        remote: &Header,
    ) -> SyncResult<()> {
        let td = self
            .chain
            .total_difficulty(&ancestor.hash())
            .unwrap_or_default();
        let queue = Mutex::new(HeaderQueue::new(ancestor.clone(), td));
        let stride = self.config.max_header_fetch.max(1);

        loop {
            let committed = queue.lock().committed();
            if committed >= remote.number {
                break;
            }
            ctx.check()?;
            let from = committed + 1;
            let remaining = remote.number - committed;

            if remaining <= stride {
                let headers = self
                    .request_headers(ctx, &target.peer, Origin::Number(from), remaining, 0, false)
                    .await?;
                if headers.first().map(|h| h.number) != Some(from) {
                    return Err(SyncError::protocol(
                        &target.peer,
                        format!("header batch does not start at {from}"),
                    ));
                }
                let mut queue = queue.lock();
                queue.insert(HeaderBatch {
                    peer: target.peer.clone(),
                    headers,
                });
                self.commit_headers(&mut queue)?;
                continue;
            }

            let count = (remaining / stride).min(self.config.max_skeleton_size.max(1));
            let skeleton = self
                .request_headers(
                    ctx,
                    &target.peer,
                    Origin::Number(from + stride - 1),
                    count,
                    stride - 1,
                    false,
                )
                .await?;
            if skeleton.is_empty() {
                return Err(SyncError::protocol(&target.peer, "empty skeleton reply"));
            }
            for (i, anchor) in skeleton.iter().enumerate() {
                let expected = from + (i as u64 + 1) * stride - 1;
                if anchor.number != expected {
                    return Err(SyncError::protocol(
                        &target.peer,
                        format!("skeleton anchor {} instead of {expected}", anchor.number),
                    ));
                }
            }
            debug!(from, anchors = skeleton.len(), stride, "Filling header skeleton");

            let job = HeaderFillJob {
                downloader: self,
                master: &target.peer,
                from,
                stride,
                skeleton: &skeleton,
                queue: &queue,
            };
            let gaps = FetchQueue::new(self.config.max_retries);
            gaps.queue(0..skeleton.len());
            self.run_fetch(ctx, &job, &gaps, &target.peer).await?;

            let queue = queue.lock();
            let last = skeleton.last().map_or(from, |h| h.number);
            if queue.committed() < last {
                return Err(SyncError::HeaderGap {
                    committed: queue.committed(),
                    buffered: queue.next_buffered().unwrap_or(last),
                });
            }
        }

        let queue = queue.lock();
        if queue.next_buffered().is_some() {
            return Err(SyncError::HeaderGap {
                committed: queue.committed(),
                buffered: queue.next_buffered().unwrap_or_default(),
            });
        }
        if queue.tip().hash() != remote.hash() {
            return Err(SyncError::invalid_chain(
                &target.peer,
                "header chain does not end at the advertised head",
            ));
        }
        if queue.td() < target.td {
            return Err(SyncError::invalid_chain(
                &target.peer,
                format!("advertised TD {} not reached, chain has {}", target.td, queue.td()),
            ));
        }
        Ok(())
    }

    /// Verify and insert every batch that extends the committed tip.
    pub(super) fn commit_headers(&self, queue: &mut HeaderQueue) -> SyncResult<()> {
        while let Some(batch) = queue.pop_ready() {
            let Some(first) = batch.headers.first() else {
                continue;
            };
            self.engine
                .verify_header(first, queue.tip())
                .map_err(|e| SyncError::invalid_chain(&batch.peer, e.to_string()))?;
            for pair in batch.headers.windows(2) {
                self.engine
                    .verify_header(&pair[1], &pair[0])
                    .map_err(|e| SyncError::invalid_chain(&batch.peer, e.to_string()))?;
            }
            if queue.td_with(&batch.headers).is_none() {
                return Err(SyncError::invalid_chain(
                    &batch.peer,
                    format!("total difficulty overflows at block {}", batch.first()),
                ));
            }
            {
                let _guard = self.chain_lock.lock();
                self.chain.insert_headers(&batch.headers)?;
            }
            queue.advance(&batch.headers);
            debug!(
                from = batch.first(),
                to = batch.last(),
                peer = %batch.peer,
                "Committed headers"
            );
        }
        Ok(())
    }
}

/// Fills the gap below each skeleton anchor.
struct HeaderFillJob<'a> {
    downloader: &'a Downloader,
    master: &'a PeerId,
    from: u64,
    stride: u64,
    skeleton: &'a [Header],
    queue: &'a Mutex<HeaderQueue>,
}

impl HeaderFillJob<'_> {
    fn gap_start(&self, gap: usize) -> u64 {
        self.from + gap as u64 * self.stride
    }

    /// The fill must be `stride` linked headers ending in the anchor.
    fn check(&self, gap: usize, headers: &[Header]) -> Result<(), String> {
        let start = self.gap_start(gap);
        if headers.len() as u64 != self.stride {
            return Err(format!(
                "gap fill of {} headers, expected {}",
                headers.len(),
                self.stride
            ));
        }
        for (i, header) in headers.iter().enumerate() {
            if header.number != start + i as u64 {
                return Err(format!("gap fill out of sequence at {}", header.number));
            }
        }
        if headers.windows(2).any(|w| w[1].parent_hash != w[0].hash()) {
            return Err("gap fill not linked".into());
        }
        match (headers.last(), self.skeleton.get(gap)) {
            (Some(last), Some(anchor)) if last.hash() == anchor.hash() => Ok(()),
            _ => Err("gap fill does not end at skeleton anchor".into()),
        }
    }
}

impl FetchJob for HeaderFillJob<'_> {
    type Key = usize;

    fn kind(&self) -> RequestKind {
        RequestKind::Headers
    }

    fn batch_limit(&self, _peer: &Peer) -> usize {
        1
    }

    fn send(&self, peer: &Peer, keys: &[usize]) -> NetworkResult<()> {
        let start = keys.first().map_or(self.from, |&gap| self.gap_start(gap));
        peer.request_headers_by_number(start, self.stride, 0, false)
    }

    fn accept(
        &self,
        peer: &PeerId,
        keys: &[usize],
        delivery: Delivery,
        _queue: &FetchQueue<usize>,
    ) -> SyncResult<Vec<usize>> {
        let (Some(&gap), Delivery::Headers(headers)) = (keys.first(), delivery) else {
            return Ok(Vec::new());
        };
        if headers.is_empty() {
            return Ok(Vec::new());
        }
        if let Err(reason) = self.check(gap, &headers) {
            if peer == self.master {
                return Err(SyncError::invalid_chain(peer, reason));
            }
            warn!(peer = %peer, gap, %reason, "Rejected skeleton fill");
            self.downloader
                .peers
                .penalize(peer, PenaltyReason::InvalidHeader);
            return Ok(Vec::new());
        }

        let mut queue = self.queue.lock();
        queue.insert(HeaderBatch {
            peer: peer.clone(),
            headers,
        });
        self.downloader.commit_headers(&mut queue)?;
        Ok(vec![gap])
    }

    fn exhausted(&self, _keys: &[usize]) -> SyncError {
        let queue = self.queue.lock();
        SyncError::HeaderGap {
            committed: queue.committed(),
            buffered: queue.next_buffered().unwrap_or(queue.committed() + 1),
        }
    }
}
