//! Assignment of requests to idle peers.
//!
//! A request waits until a suitable peer is idle for its kind, reserves that
//! peer and releases it when the [`Reservation`] drops. Candidates are
//! ordered so that starving peers come first, then by measured throughput,
//! then by registration order.

use crate::context::OpContext;
use crate::metrics::SyncMetrics;
use crate::{SyncError, SyncResult};
use avn_network::{Peer, PeerId, PeerSet, RequestKind};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// What a request needs from a peer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub kind: RequestKind,
    /// Only this peer may serve the request.
    pub pinned: Option<PeerId>,
    /// Peers that must not serve the request.
    pub exclude: HashSet<PeerId>,
}

impl FetchRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            pinned: None,
            exclude: HashSet::new(),
        }
    }

    pub fn pinned(mut self, peer: &PeerId) -> Self {
        self.pinned = Some(peer.clone());
        self
    }

    pub fn exclude(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.exclude.extend(peers);
        self
    }

    fn accepts(&self, peer: &Peer) -> bool {
        if self.exclude.contains(peer.id()) {
            return false;
        }
        self.pinned.as_ref().map_or(true, |id| id == peer.id())
    }
}

/// A peer reserved for one request kind.
pub struct Reservation {
    peer: Arc<Peer>,
    kind: RequestKind,
    peers: Arc<PeerSet>,
    started: Instant,
}

impl Reservation {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.peer.release(self.kind);
        self.peers.notify_changed();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("peer", self.peer.id())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Hands out idle peers to requests.
pub struct RequestDistributor {
    peers: Arc<PeerSet>,
    metrics: Arc<SyncMetrics>,
    idle_wait_timeout: Duration,
    starvation_threshold: Duration,
}

impl RequestDistributor {
    pub fn new(
        peers: Arc<PeerSet>,
        metrics: Arc<SyncMetrics>,
        idle_wait_timeout: Duration,
        starvation_threshold: Duration,
    ) -> Self {
        Self {
            peers,
            metrics,
            idle_wait_timeout,
            starvation_threshold,
        }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// Reserve the best idle peer for `request` without waiting.
    pub fn try_reserve<F>(&self, request: &FetchRequest, filter: F) -> Option<Reservation>
    where
        F: Fn(&Peer) -> bool,
    {
        let candidates: Vec<_> = self
            .peers
            .idle_peers(request.kind)
            .into_iter()
            .filter(|p| request.accepts(p) && filter(p))
            .collect();

        self.order(candidates, request.kind)
            .into_iter().find_map(|peer| {
            peer.try_reserve(request.kind).then(|| {
                trace!(peer = %peer.id(), kind = %request.kind, "Reserved peer");
                Reservation {
                    peer,
                    kind: request.kind,
                    peers: Arc::clone(&self.peers),
                    started: Instant::now(),
                }
            })
        })
    }

    /// Reserve a peer, waiting for one to become idle.
    ///
    /// Fails with `PeerDropped` if a pinned peer leaves, `Stalled` if no
    /// peer frees up within the idle wait timeout, and with the context's
    /// error on cancellation or deadline.
    pub async fn reserve(&self, request: &FetchRequest, ctx: &OpContext) -> SyncResult<Reservation> {
        self.reserve_where(request, ctx, |_| true).await
    }

    pub async fn reserve_where<F>(
        &self,
        request: &FetchRequest,
        ctx: &OpContext,
        filter: F,
    ) -> SyncResult<Reservation>
    where
        F: Fn(&Peer) -> bool,
    {
        let give_up = Instant::now() + self.idle_wait_timeout;
        let mut throttled = false;
        loop {
            let changed = self.peers.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            ctx.check()?;
            if let Some(id) = &request.pinned {
                if !self.peers.contains(id) {
                    return Err(SyncError::PeerDropped(id.clone()));
                }
            }
            if let Some(reservation) = self.try_reserve(request, &filter) {
                return Ok(reservation);
            }
            if !throttled {
                throttled = true;
                self.metrics.downloader.throttle.inc();
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = ctx.cancelled() => return Err(SyncError::Canceled),
                _ = sleep_until(give_up.min(ctx.deadline())) => {
                    ctx.check()?;
                    return Err(SyncError::Stalled(format!(
                        "no idle peer for {} request",
                        request.kind
                    )));
                }
            }
        }
    }

    /// Reserve a peer and run `call` on it. Resolves with `PeerDropped` if
    /// the peer closes first.
    pub async fn dispatch<T, F, Fut>(
        &self,
        request: &FetchRequest,
        ctx: &OpContext,
        call: F,
    ) -> SyncResult<T>
    where
        F: FnOnce(Arc<Peer>) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let reservation = self.reserve(request, ctx).await?;
        let peer = Arc::clone(reservation.peer());
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(SyncError::Canceled),
            _ = peer.closed() => Err(SyncError::PeerDropped(peer.id().clone())),
            out = call(Arc::clone(&peer)) => out,
        };
        drop(reservation);
        result
    }

    /// Starving peers first, then by measured throughput, then oldest.
    /// Each candidate's state is read once before sorting.
    fn order(&self, peers: Vec<Arc<Peer>>, kind: RequestKind) -> Vec<Arc<Peer>> {
        let now = Instant::now();
        let threshold = self.starvation_threshold;
        let mut ranked: Vec<_> = peers
            .into_iter()
            .map(|p| {
                let starving = p
                    .last_dispatch(kind)
                    .map_or(true, |t| now.saturating_duration_since(t) >= threshold);
                let throughput = p.rate(kind).throughput();
                (starving, throughput, p.seq(), p)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        ranked.into_iter().map(|(.., p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avn_chain::H256;
    use avn_network::{Capability, NullTransport, PeerHead};
    use tokio_util::sync::CancellationToken;

    fn peer(id: u8) -> Arc<Peer> {
        Arc::new(Peer::new(
            PeerId(vec![id]),
            66,
            [Capability::Eth],
            PeerHead {
                hash: H256([id; 32]),
                td: 1,
            },
            Arc::new(NullTransport),
        ))
    }

    fn setup(n: u8) -> (Arc<PeerSet>, RequestDistributor) {
        let peers = Arc::new(PeerSet::new());
        for id in 1..=n {
            peers.register(peer(id)).unwrap();
        }
        let dist = RequestDistributor::new(
            Arc::clone(&peers),
            Arc::new(SyncMetrics::new()),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        (peers, dist)
    }

    fn ctx() -> OpContext {
        OpContext::with_timeout(CancellationToken::new(), Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_is_exclusive_and_released() {
        let (peers, dist) = setup(1);
        let req = FetchRequest::new(RequestKind::Bodies);
        let r = dist.try_reserve(&req, |_| true).unwrap();
        assert!(dist.try_reserve(&req, |_| true).is_none());
        drop(r);
        assert!(peers.peer(&PeerId(vec![1])).unwrap().is_idle(RequestKind::Bodies));
        assert!(dist.try_reserve(&req, |_| true).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_fast_peer() {
        let (peers, dist) = setup(2);
        let req = FetchRequest::new(RequestKind::Bodies);
        // Both dispatched recently, so neither is starving.
        for id in [1u8, 2] {
            let p = peers.peer(&PeerId(vec![id])).unwrap();
            assert!(p.try_reserve(RequestKind::Bodies));
            p.release(RequestKind::Bodies);
        }
        peers
            .peer(&PeerId(vec![1]))
            .unwrap()
            .record_delivery(RequestKind::Bodies, 10, Duration::from_secs(1));
        peers
            .peer(&PeerId(vec![2]))
            .unwrap()
            .record_delivery(RequestKind::Bodies, 100, Duration::from_secs(1));
        let r = dist.try_reserve(&req, |_| true).unwrap();
        assert_eq!(r.peer().id(), &PeerId(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_starving_peer_first() {
        let (peers, dist) = setup(2);
        let req = FetchRequest::new(RequestKind::Headers);
        let fast = peers.peer(&PeerId(vec![1])).unwrap();
        assert!(fast.try_reserve(RequestKind::Headers));
        fast.release(RequestKind::Headers);
        fast.record_delivery(RequestKind::Headers, 1000, Duration::from_secs(1));
        // Peer 2 has never been used.
        let r = dist.try_reserve(&req, |_| true).unwrap();
        assert_eq!(r.peer().id(), &PeerId(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_ranks_starving_then_throughput_then_age() {
        let (peers, dist) = setup(4);
        let kind = RequestKind::Receipts;
        for (id, items) in [(1u8, 10), (2, 500), (3, 10)] {
            let p = peers.peer(&PeerId(vec![id])).unwrap();
            assert!(p.try_reserve(kind));
            p.release(kind);
            p.record_delivery(kind, items, Duration::from_secs(1));
        }

        let ordered: Vec<PeerId> = dist
            .order(peers.all(), kind)
            .iter()
            .map(|p| p.id().clone())
            .collect();
        assert_eq!(ordered, [4u8, 2, 1, 3].map(|id| PeerId(vec![id])).to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_and_excluded() {
        let (_peers, dist) = setup(3);
        let req = FetchRequest::new(RequestKind::Headers).pinned(&PeerId(vec![3]));
        assert_eq!(
            dist.try_reserve(&req, |_| true).unwrap().peer().id(),
            &PeerId(vec![3])
        );
        let req = FetchRequest::new(RequestKind::Headers).exclude([PeerId(vec![1])]);
        assert_eq!(
            dist.try_reserve(&req, |_| true).unwrap().peer().id(),
            &PeerId(vec![2])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_waits_for_release() {
        let (_peers, dist) = setup(1);
        let dist = Arc::new(dist);
        let req = FetchRequest::new(RequestKind::Receipts);
        let held = dist.try_reserve(&req, |_| true).unwrap();

        let waiter = {
            let dist = Arc::clone(&dist);
            let req = req.clone();
            tokio::spawn(async move { dist.reserve(&req, &ctx()).await.map(|r| r.peer().id().clone()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.await.unwrap(), Ok(PeerId(vec![1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_leaves_peers_idle() {
        let (peers, dist) = setup(1);
        let dist = Arc::new(dist);
        let req = FetchRequest::new(RequestKind::Headers);
        let held = dist.try_reserve(&req, |_| true).unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let dist = Arc::clone(&dist);
            let req = req.clone();
            let ctx = OpContext::with_timeout(token.clone(), Duration::from_secs(600));
            tokio::spawn(async move { dist.reserve(&req, &ctx).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(SyncError::Canceled));

        drop(held);
        assert!(peers.peer(&PeerId(vec![1])).unwrap().is_idle(RequestKind::Headers));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_peer_dropped() {
        let (peers, dist) = setup(1);
        let req = FetchRequest::new(RequestKind::Headers).pinned(&PeerId(vec![1]));
        let _held = dist.try_reserve(&req, |_| true).unwrap();
        peers.unregister(&PeerId(vec![1])).unwrap();
        assert_eq!(
            dist.reserve(&req, &ctx()).await.unwrap_err(),
            SyncError::PeerDropped(PeerId(vec![1]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_gives_up_without_peers() {
        let (_peers, dist) = setup(0);
        let req = FetchRequest::new(RequestKind::Headers);
        assert!(matches!(
            dist.reserve(&req, &ctx()).await,
            Err(SyncError::Stalled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_peer_closed() {
        let (peers, dist) = setup(1);
        let req = FetchRequest::new(RequestKind::Bodies);
        let peers2 = Arc::clone(&peers);
        let res: SyncResult<()> = dist
            .dispatch(&req, &ctx(), |p| async move {
                peers2.unregister(p.id()).unwrap();
                std::future::pending().await
            })
            .await;
        assert_eq!(res, Err(SyncError::PeerDropped(PeerId(vec![1]))));
    }
}
