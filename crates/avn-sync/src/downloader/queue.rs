//! Work queue for one fetch phase.
//!
//! Items move `pending -> in flight -> completed`. A failed item goes back
//! to pending with the failing peer remembered, so it is retried elsewhere;
//! after `max_retries` failures it is parked as permanently failed.

use avn_network::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Completed keys remembered to reject re-queueing.
const COMPLETED_CACHE_SIZE: usize = 65_536;

/// A unit of work.
#[derive(Debug, Clone)]
pub struct FetchTask {
    /// Peer currently serving the task.
    pub peer: Option<PeerId>,
    pub requested_at: Option<Instant>,
    pub retries: u32,
    /// Peers that failed to deliver this item.
    pub failed_peers: HashSet<PeerId>,
}

impl FetchTask {
    fn new() -> Self {
        Self {
            peer: None,
            requested_at: None,
            retries: 0,
            failed_peers: HashSet::new(),
        }
    }

    pub fn peer_failed(&self, peer: &PeerId) -> bool {
        self.failed_peers.contains(peer)
    }
}

struct Inner<K: Hash + Eq> {
    pending: BTreeMap<K, FetchTask>,
    in_flight: HashMap<K, FetchTask>,
    completed: LruCache<K, ()>,
    completed_count: usize,
    failed: Vec<K>,
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct FetchQueue<K: Hash + Eq> {
    max_retries: u32,
    inner: Mutex<Inner<K>>,
    changed: Notify,
}

impl<K> FetchQueue<K>
where
    K: Ord + Hash + Clone + Debug,
{
    pub fn new(max_retries: u32) -> Self {
        let cache = NonZeroUsize::new(COMPLETED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_retries: max_retries.max(1),
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                in_flight: HashMap::new(),
                completed: LruCache::new(cache),
                completed_count: 0,
                failed: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }

    /// Add work, skipping keys already pending, in flight or completed.
    /// Returns how many were added.
    pub fn queue(&self, keys: impl IntoIterator<Item = K>) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for key in keys {
            if inner.pending.contains_key(&key)
                || inner.in_flight.contains_key(&key)
                || inner.completed.contains(&key)
            {
                continue;
            }
            inner.pending.insert(key, FetchTask::new());
            added += 1;
        }
        drop(inner);
        if added > 0 {
            self.changed.notify_waiters();
        }
        added
    }

    /// Take up to `max` pending items, lowest key first, that `peer` has not
    /// failed, and mark them in flight on it.
    pub fn reserve_for(&self, peer: &PeerId, max: usize) -> Vec<K> {
        let mut inner = self.inner.lock();
        let keys: Vec<K> = inner
            .pending
            .iter()
            .filter(|(_, t)| !t.peer_failed(peer))
            .take(max)
            .map(|(k, _)| k.clone())
            .collect();
        let now = Instant::now();
        for key in &keys {
            if let Some(mut task) = inner.pending.remove(key) {
                task.peer = Some(peer.clone());
                task.requested_at = Some(now);
                inner.in_flight.insert(key.clone(), task);
            }
        }
        keys
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    /// Whether `peer` could serve any pending item.
    pub fn has_work_for(&self, peer: &PeerId) -> bool {
        self.inner
            .lock()
            .pending
            .values()
            .any(|t| !t.peer_failed(peer))
    }

    pub fn complete(&self, key: &K) {
        let mut inner = self.inner.lock();
        if inner.in_flight.remove(key).is_some() || inner.pending.remove(key).is_some() {
            inner.completed.put(key.clone(), ());
            inner.completed_count += 1;
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Return items to pending after `peer` failed them. Items past the
    /// retry limit are parked; those are returned.
    pub fn fail(&self, keys: &[K], peer: &PeerId) -> Vec<K> {
        let mut inner = self.inner.lock();
        let mut exhausted = Vec::new();
        for key in keys {
            let Some(mut task) = inner.in_flight.remove(key) else {
                continue;
            };
            task.retries += 1;
            task.peer = None;
            task.requested_at = None;
            task.failed_peers.insert(peer.clone());
            if task.retries >= self.max_retries {
                warn!(
                    key = ?key,
                    retries = task.retries,
                    failed_peers = task.failed_peers.len(),
                    "Fetch failed permanently"
                );
                inner.failed.push(key.clone());
                exhausted.push(key.clone());
            } else {
                debug!(key = ?key, retries = task.retries, "Fetch will retry");
                inner.pending.insert(key.clone(), task);
            }
        }
        drop(inner);
        self.changed.notify_waiters();
        exhausted
    }

    /// Return items to pending without counting a failure, e.g. when the
    /// request never reached the peer.
    pub fn requeue(&self, keys: &[K]) {
        let mut inner = self.inner.lock();
        for key in keys {
            if let Some(mut task) = inner.in_flight.remove(key) {
                task.peer = None;
                task.requested_at = None;
                inner.pending.insert(key.clone(), task);
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Pending items every one of `peers` has already failed.
    pub fn stuck(&self, peers: &[PeerId]) -> Vec<K> {
        if peers.is_empty() {
            return Vec::new();
        }
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|(_, t)| peers.iter().all(|p| t.peer_failed(p)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Items currently in flight on `peer`.
    pub fn in_flight_for(&self, peer: &PeerId) -> Vec<K> {
        self.inner
            .lock()
            .in_flight
            .iter()
            .filter(|(_, t)| t.peer.as_ref() == Some(peer))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Nothing pending and nothing in flight.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.in_flight.is_empty()
    }

    pub fn failed(&self) -> Vec<K> {
        self.inner.lock().failed.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            in_flight: inner.in_flight.len(),
            completed: inner.completed_count,
            failed: inner.failed.len(),
        }
    }

    /// Resolves on the next change. Enable it before checking state.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}
