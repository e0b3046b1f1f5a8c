//! Head lookup and common ancestor search.

use super::router::Delivery;
use super::{Downloader, SyncTarget};
use crate::config::SyncMode;
use crate::context::OpContext;
use crate::distributor::FetchRequest;
use crate::{SyncError, SyncResult};
use avn_chain::{Header, H256};
use avn_network::{PeerId, RequestKind};
use tracing::{debug, trace};

/// Where a header request starts.
#[derive(Debug, Clone, Copy)]
pub(super) enum Origin {
    Hash(H256),
    Number(u64),
}

impl Downloader {
    /// Request headers from one specific peer.
    pub(super) async fn request_headers(
        &self,
        ctx: &OpContext,
        peer: &PeerId,
        origin: Origin,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> SyncResult<Vec<Header>> {
        let request = FetchRequest::new(RequestKind::Headers).pinned(peer);
        let reservation = self.distributor.reserve(&request, ctx).await?;
        let delivery = self
            .request(ctx, &reservation, |p| match origin {
                Origin::Hash(hash) => p.request_headers_by_hash(hash, amount, skip, reverse),
                Origin::Number(number) => {
                    p.request_headers_by_number(number, amount, skip, reverse)
                }
            })
            .await?;
        match delivery {
            Delivery::Headers(headers) if headers.len() as u64 <= amount => Ok(headers),
            Delivery::Headers(headers) => Err(SyncError::protocol(
                peer,
                format!("{} headers for a request of {amount}", headers.len()),
            )),
            other => Err(SyncError::protocol(
                peer,
                format!("{} reply to a header request", other.kind()),
            )),
        }
    }

    /// Fetch the header of the master's advertised head.
    pub(super) async fn fetch_head(&self, ctx: &OpContext, target: &SyncTarget) -> SyncResult<Header> {
        let headers = self
            .request_headers(ctx, &target.peer, Origin::Hash(target.head), 1, 0, false)
            .await?;
        match headers.as_slice() {
            [head] if head.hash() == target.head => {
                debug!(peer = %target.peer, number = head.number, "Remote head retrieved");
                Ok(head.clone())
            }
            [] => Err(SyncError::protocol(&target.peer, "empty head header reply")),
            _ => Err(SyncError::protocol(&target.peer, "head header mismatch")),
        }
    }

    /// Highest block shared by the local chain and the remote chain ending
    /// in `remote`.
    ///
    /// Probes downwards from `min(local head, remote head)`: the first round
    /// walks consecutive headers, each further round multiplies the stride.
    /// Once a known header is hit the exact fork point is binary searched
    /// between it and the last unknown probe. The search never goes below
    /// `local head - max_fork_ancestry`.
    pub(super) async fn find_ancestor(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        remote: &Header,
    ) -> SyncResult<Header> {
        let local = self.local_head(target.mode).number;
        let floor = local.saturating_sub(self.config.max_fork_ancestry);
        let top = local.min(remote.number);
        let probes = self.config.ancestor_probe_count.max(1);
        let growth = self.config.ancestor_probe_growth.max(2);
        if top < floor {
            return Err(SyncError::invalid_chain(
                &target.peer,
                format!("remote head {} below ancestry floor {floor}", remote.number),
            ));
        }

        let mut origin = top;
        let mut stride = 1u64;
        // Lowest number known to be unknown locally.
        let mut unknown_above = top + 1;

        loop {
            let count = ((origin - floor) / stride + 1).min(probes);
            let headers = self
                .request_headers(
                    ctx,
                    &target.peer,
                    Origin::Number(origin),
                    count,
                    stride - 1,
                    true,
                )
                .await?;
            if headers.is_empty() {
                return Err(SyncError::protocol(&target.peer, "empty ancestor probe reply"));
            }
            for (i, header) in headers.iter().enumerate() {
                let expected = origin - i as u64 * stride;
                if header.number != expected {
                    return Err(SyncError::protocol(
                        &target.peer,
                        format!("probe returned block {} instead of {expected}", header.number),
                    ));
                }
                if self.is_known(header, target.mode) {
                    trace!(number = header.number, stride, "Ancestor probe hit");
                    return self
                        .bisect_ancestor(ctx, target, header.clone(), unknown_above)
                        .await;
                }
                unknown_above = header.number;
            }

            let lowest = unknown_above;
            if lowest <= floor || (headers.len() as u64) < count {
                break;
            }
            stride = stride.saturating_mul(growth);
            origin = lowest.saturating_sub(stride).max(floor);
            if origin >= lowest {
                break;
            }
        }

        if floor == 0 {
            Err(SyncError::invalid_chain(&target.peer, "genesis mismatch"))
        } else {
            Err(SyncError::invalid_chain(
                &target.peer,
                format!("no common ancestor above block {floor}"),
            ))
        }
    }

    /// Narrow `[known, unknown)` down to the last shared block.
    async fn bisect_ancestor(
        &self,
        ctx: &OpContext,
        target: &SyncTarget,
        mut known: Header,
        mut unknown: u64,
    ) -> SyncResult<Header> {
        while unknown - known.number > 1 {
            let mid = known.number + (unknown - known.number) / 2;
            let headers = self
                .request_headers(ctx, &target.peer, Origin::Number(mid), 1, 0, false)
                .await?;
            let header = match headers.as_slice() {
                [h] if h.number == mid => h.clone(),
                _ => {
                    return Err(SyncError::protocol(
                        &target.peer,
                        format!("bad reply while searching ancestor at {mid}"),
                    ))
                }
            };
            if self.is_known(&header, target.mode) {
                known = header;
            } else {
                unknown = mid;
            }
        }
        Ok(known)
    }

    fn is_known(&self, header: &Header, mode: SyncMode) -> bool {
        let hash = header.hash();
        match mode {
            SyncMode::Full => self.chain.has_block(&hash, header.number),
            SyncMode::Fast => self.chain.has_fast_block(&hash, header.number),
        }
    }
}
