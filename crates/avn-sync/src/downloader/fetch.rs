//! Request plumbing shared by every fetch phase.

use super::queue::FetchQueue;
use super::router::Delivery;
use super::Downloader;
use crate::context::OpContext;
use crate::distributor::{FetchRequest, Reservation};
use crate::{SyncError, SyncResult};
use avn_network::{
    DisconnectReason, NetworkError, NetworkResult, Peer, PeerId, PenaltyReason, RequestKind,
};
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// One fetch phase: how to request a batch of keys and how to consume the
/// reply.
pub(crate) trait FetchJob: Sync {
    type Key: Ord + Hash + Clone + Debug + Send + Sync;

    fn kind(&self) -> RequestKind;

    /// Keys to request from `peer` at once.
    fn batch_limit(&self, peer: &Peer) -> usize;

    fn send(&self, peer: &Peer, keys: &[Self::Key]) -> NetworkResult<()>;

    /// Consume a reply to a request for `keys`, returning the keys it
    /// satisfied. The rest are retried on other peers. An error fails the
    /// whole operation.
    fn accept(
        &self,
        peer: &PeerId,
        keys: &[Self::Key],
        delivery: Delivery,
        queue: &FetchQueue<Self::Key>,
    ) -> SyncResult<Vec<Self::Key>>;

    /// Error reported when keys fail on every retry.
    fn exhausted(&self, keys: &[Self::Key]) -> SyncError {
        SyncError::Stalled(format!(
            "{} {} items failed on every retry",
            keys.len(),
            self.kind()
        ))
    }
}

impl Downloader {
    /// Send one request on a reserved peer and wait for its reply.
    ///
    /// Fails with `PeerUnresponsive` after the request timeout and with
    /// `PeerDropped` if the peer closes first.
    pub(super) async fn request<F>(
        &self,
        ctx: &OpContext,
        reservation: &Reservation,
        send: F,
    ) -> SyncResult<Delivery>
    where
        F: FnOnce(&Peer) -> NetworkResult<()>,
    {
        let peer = reservation.peer();
        let kind = reservation.kind();
        let metrics = self.metrics.downloader.kind(kind);
        let mut pending = self.router.expect(peer.id(), kind);
        let started = Instant::now();

        send(peer).map_err(|err| match err {
            NetworkError::PeerClosed(id) => SyncError::PeerDropped(id),
            other => SyncError::Network(other),
        })?;

        let timeout = self.config.request_timeout;
        let reply = ctx
            .run(async {
                tokio::select! {
                    _ = peer.closed() => Err(SyncError::PeerDropped(peer.id().clone())),
                    r = tokio::time::timeout(timeout, pending.recv()) => Ok(r),
                }
            })
            .await??;

        let elapsed = started.elapsed();
        match reply {
            Err(_) => {
                metrics.timeouts.inc();
                debug!(peer = %peer.id(), %kind, "Request timed out");
                Err(SyncError::PeerUnresponsive(peer.id().clone()))
            }
            Ok(None) => Err(SyncError::PeerDropped(peer.id().clone())),
            Ok(Some(delivery)) => {
                metrics.requests.record(elapsed);
                peer.record_delivery(kind, delivery.len(), elapsed);
                trace!(peer = %peer.id(), %kind, items = delivery.len(), ?elapsed, "Reply received");
                Ok(delivery)
            }
        }
    }

    /// Drain `queue` with concurrent workers, each reserving idle peers.
    pub(super) async fn run_fetch<J: FetchJob>(
        &self,
        ctx: &OpContext,
        job: &J,
        queue: &FetchQueue<J::Key>,
        master: &PeerId,
    ) -> SyncResult<()> {
        if queue.is_done() {
            return Ok(());
        }
        let workers = self
            .config
            .parallel_requests
            .clamp(1, self.peers.len().max(1));
        let tasks = (0..workers).map(|_| self.fetch_worker(ctx, job, queue, master));
        futures::future::try_join_all(tasks).await?;
        Ok(())
    }

    async fn fetch_worker<J: FetchJob>(
        &self,
        ctx: &OpContext,
        job: &J,
        queue: &FetchQueue<J::Key>,
        master: &PeerId,
    ) -> SyncResult<()> {
        let kind = job.kind();
        let request = FetchRequest::new(kind);
        let mut waiting_since: Option<Instant> = None;

        loop {
            let peers_changed = self.peers.changed();
            let queue_changed = queue.changed();
            tokio::pin!(peers_changed, queue_changed);
            peers_changed.as_mut().enable();
            queue_changed.as_mut().enable();

            ctx.check()?;
            if queue.is_done() {
                return Ok(());
            }

            if queue.has_pending() {
                let reservation = self
                    .distributor
                    .try_reserve(&request, |p| queue.has_work_for(p.id()));
                if let Some(reservation) = reservation {
                    waiting_since = None;
                    let limit = job.batch_limit(reservation.peer());
                    let keys = queue.reserve_for(reservation.peer().id(), limit);
                    if !keys.is_empty() {
                        self.fetch_batch(ctx, job, queue, reservation, keys, master)
                            .await?;
                    }
                    continue;
                }

                if queue.in_flight() == 0 {
                    let capable: Vec<PeerId> = self
                        .peers
                        .all()
                        .iter()
                        .filter(|p| p.supports(kind.capability()))
                        .map(|p| p.id().clone())
                        .collect();
                    let stuck = queue.stuck(&capable);
                    if !stuck.is_empty() && !capable.iter().any(|p| queue.has_work_for(p)) {
                        return Err(job.exhausted(&stuck));
                    }
                }

                if waiting_since.is_none() {
                    waiting_since = Some(Instant::now());
                    self.metrics.downloader.throttle.inc();
                }
            }

            let give_up = waiting_since.map(|t| t + self.config.idle_wait_timeout);
            tokio::select! {
                _ = &mut peers_changed => {}
                _ = &mut queue_changed => {}
                _ = ctx.cancelled() => return Err(SyncError::Canceled),
                _ = sleep_until(ctx.deadline()) => return Err(SyncError::Timeout),
                _ = sleep_until(give_up.unwrap_or_else(|| ctx.deadline())), if give_up.is_some() => {
                    return Err(SyncError::Stalled(format!("no idle peer for {kind} fetch")));
                }
            }
        }
    }

    async fn fetch_batch<J: FetchJob>(
        &self,
        ctx: &OpContext,
        job: &J,
        queue: &FetchQueue<J::Key>,
        reservation: Reservation,
        keys: Vec<J::Key>,
        master: &PeerId,
    ) -> SyncResult<()> {
        let peer = reservation.peer().id().clone();
        let result = self
            .request(ctx, &reservation, |p| job.send(p, &keys))
            .await;

        match result {
            Ok(delivery) => {
                let accepted = match job.accept(&peer, &keys, delivery, queue) {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        queue.requeue(&keys);
                        return Err(err);
                    }
                };
                for key in &accepted {
                    queue.complete(key);
                }
                let done: HashSet<&J::Key> = accepted.iter().collect();
                let missing: Vec<J::Key> = keys
                    .iter()
                    .filter(|k| !done.contains(k))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    return Ok(());
                }
                if accepted.is_empty() {
                    self.peers.penalize(&peer, PenaltyReason::UselessResponse);
                }
                let exhausted = queue.fail(&missing, &peer);
                drop(reservation);
                if exhausted.is_empty() {
                    Ok(())
                } else {
                    Err(job.exhausted(&exhausted))
                }
            }
            Err(SyncError::PeerUnresponsive(id)) => {
                let exhausted = queue.fail(&keys, &id);
                drop(reservation);
                if id == *master {
                    return Err(SyncError::PeerUnresponsive(id));
                }
                self.peers.drop_peer(&id, DisconnectReason::Unresponsive);
                if exhausted.is_empty() {
                    Ok(())
                } else {
                    Err(job.exhausted(&exhausted))
                }
            }
            Err(SyncError::PeerDropped(id)) => {
                queue.requeue(&keys);
                if id == *master {
                    return Err(SyncError::PeerDropped(id));
                }
                Ok(())
            }
            Err(err) => {
                queue.requeue(&keys);
                Err(err)
            }
        }
    }
}
