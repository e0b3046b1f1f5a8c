//! Registry of connected peers.

use crate::peer::{Peer, PeerId, RequestKind};
use crate::penalties::PenaltyReason;
use crate::transport::DisconnectReason;
use crate::{NetworkError, NetworkResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Concurrent set of registered peers.
///
/// Every membership change and every released reservation wakes the
/// waiters of [`PeerSet::changed`].
pub struct PeerSet {
    peers: DashMap<PeerId, Arc<Peer>>,
    next_seq: AtomicU64,
    changed: Notify,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Register a peer after a successful handshake.
    pub fn register(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        match self.peers.entry(peer.id().clone()) {
            Entry::Occupied(_) => return Err(NetworkError::DuplicatePeer(peer.id().clone())),
            Entry::Vacant(slot) => {
                peer.set_seq(self.next_seq.fetch_add(1, Ordering::AcqRel));
                let head = peer.head();
                info!(
                    peer = %peer.id(),
                    version = peer.version(),
                    td = head.td,
                    head = %head.hash.short(),
                    "Peer registered"
                );
                slot.insert(peer);
            }
        }
        self.notify_changed();
        Ok(())
    }

    /// Remove a peer and close it, failing work pending on it.
    pub fn unregister(&self, id: &PeerId) -> NetworkResult<Arc<Peer>> {
        let (_, peer) = self
            .peers
            .remove(id)
            .ok_or_else(|| NetworkError::UnknownPeer(id.clone()))?;
        peer.close();
        debug!(peer = %id, remaining = self.peers.len(), "Peer unregistered");
        self.notify_changed();
        Ok(peer)
    }

    /// Unregister and disconnect with a reason. Unknown ids are ignored.
    pub fn drop_peer(&self, id: &PeerId, reason: DisconnectReason) {
        if let Ok(peer) = self.unregister(id) {
            warn!(peer = %id, %reason, "Dropping peer");
            peer.transport().disconnect(reason);
        }
    }

    /// Penalise a peer, dropping it once its penalty crosses the threshold.
    /// Returns `true` if the peer was dropped.
    pub fn penalize(&self, id: &PeerId, reason: PenaltyReason) -> bool {
        let Some(peer) = self.peer(id) else {
            return false;
        };
        if peer.penalize(reason) {
            self.drop_peer(id, reason.disconnect_reason());
            return true;
        }
        debug!(peer = %id, %reason, penalty = peer.score().current_penalty(), "Penalized peer");
        false
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All peers in registration order.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.iter().map(|p| Arc::clone(p.value())).collect();
        peers.sort_by_key(|p| p.seq());
        peers
    }

    /// Registered peer with the greatest total difficulty. Ties go to the
    /// earliest registration.
    pub fn peer_with_highest_td(&self) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .map(|p| Arc::clone(p.value()))
            .filter(|p| !p.is_closed())
            .max_by(|a, b| a.td().cmp(&b.td()).then_with(|| b.seq().cmp(&a.seq())))
    }

    /// Open peers with no outstanding request of `kind`, registration order.
    pub fn idle_peers(&self, kind: RequestKind) -> Vec<Arc<Peer>> {
        self.all()
            .into_iter()
            .filter(|p| !p.is_closed() && p.is_idle(kind) && p.supports(kind.capability()))
            .collect()
    }

    pub fn header_idle_peers(&self) -> Vec<Arc<Peer>> {
        self.idle_peers(RequestKind::Headers)
    }

    pub fn body_idle_peers(&self) -> Vec<Arc<Peer>> {
        self.idle_peers(RequestKind::Bodies)
    }

    pub fn receipt_idle_peers(&self) -> Vec<Arc<Peer>> {
        self.idle_peers(RequestKind::Receipts)
    }

    pub fn state_idle_peers(&self) -> Vec<Arc<Peer>> {
        self.idle_peers(RequestKind::State)
    }

    /// Future resolving on the next membership or idleness change. Call
    /// `enable()` on it before checking state to avoid missing a wakeup.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub fn notify_changed(&self) {
        self.changed.notify_waiters();
    }

    /// Drop every peer, used on shutdown.
    pub fn close(&self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.key().clone()).collect();
        for id in ids {
            self.drop_peer(&id, DisconnectReason::Requested);
        }
    }
}
