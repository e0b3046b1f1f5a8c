//! A connected peer as seen by the sync core.

use crate::penalties::PenaltyReason;
use crate::scoring::{PeerScore, RateTracker};
use crate::transport::{DisconnectReason, PeerTransport};
use crate::{NetworkError, NetworkResult};
use avn_chain::{TotalDifficulty, H256};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Unique peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Protocol extensions a peer may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Headers, bodies and receipts.
    Eth,
    /// State trie entries.
    Snap,
}

/// Kinds of sync request a peer can be busy with. A peer serves at most one
/// request of each kind at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Headers,
    Bodies,
    Receipts,
    State,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Headers,
        RequestKind::Bodies,
        RequestKind::Receipts,
        RequestKind::State,
    ];

    fn index(self) -> usize {
        match self {
            Self::Headers => 0,
            Self::Bodies => 1,
            Self::Receipts => 2,
            Self::State => 3,
        }
    }

    /// Capability required to serve this kind.
    pub fn capability(self) -> Capability {
        match self {
            Self::State => Capability::Snap,
            _ => Capability::Eth,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Headers => "headers",
            Self::Bodies => "bodies",
            Self::Receipts => "receipts",
            Self::State => "state",
        };
        f.write_str(s)
    }
}

/// Advertised chain head of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: H256,
    pub td: TotalDifficulty,
}

#[derive(Debug, Default)]
struct KindState {
    busy: AtomicBool,
    rate: Mutex<RateTracker>,
    last_dispatch: Mutex<Option<Instant>>,
}

/// A connected peer.
///
/// Owns its transport; the registry hands out `Arc<Peer>`. Closing the peer
/// cancels its token so any work waiting on it unwinds.
pub struct Peer {
    id: PeerId,
    version: u32,
    capabilities: HashSet<Capability>,
    transport: Arc<dyn PeerTransport>,
    head: RwLock<PeerHead>,
    score: Mutex<PeerScore>,
    kinds: [KindState; 4],
    seq: AtomicU64,
    closed: CancellationToken,
}

impl Peer {
    pub fn new(
        id: PeerId,
        version: u32,
        capabilities: impl IntoIterator<Item = Capability>,
        head: PeerHead,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            id,
            version,
            capabilities: capabilities.into_iter().collect(),
            transport,
            head: RwLock::new(head),
            score: Mutex::new(PeerScore::new()),
            kinds: Default::default(),
            seq: AtomicU64::new(u64::MAX),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn head(&self) -> PeerHead {
        *self.head.read()
    }

    pub fn td(&self) -> TotalDifficulty {
        self.head.read().td
    }

    pub fn set_head(&self, hash: H256, td: TotalDifficulty) {
        *self.head.write() = PeerHead { hash, td };
    }

    /// Registration order, `u64::MAX` until registered.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }

    // ----- idleness -----

    pub fn is_idle(&self, kind: RequestKind) -> bool {
        !self.kinds[kind.index()].busy.load(Ordering::Acquire)
    }

    /// Atomically mark the peer busy for `kind`. Fails if it already was or
    /// the peer is closed.
    pub fn try_reserve(&self, kind: RequestKind) -> bool {
        if self.is_closed() {
            return false;
        }
        let state = &self.kinds[kind.index()];
        let reserved = state
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if reserved {
            *state.last_dispatch.lock() = Some(Instant::now());
        }
        reserved
    }

    pub fn release(&self, kind: RequestKind) {
        self.kinds[kind.index()].busy.store(false, Ordering::Release);
    }

    /// When the last request of this kind was dispatched.
    pub fn last_dispatch(&self, kind: RequestKind) -> Option<Instant> {
        *self.kinds[kind.index()].last_dispatch.lock()
    }

    // ----- rates and reputation -----

    /// Record a completed request of `items` items.
    pub fn record_delivery(&self, kind: RequestKind, items: usize, elapsed: Duration) {
        self.kinds[kind.index()].rate.lock().update(items, elapsed);
    }

    pub fn rate(&self, kind: RequestKind) -> RateTracker {
        *self.kinds[kind.index()].rate.lock()
    }

    /// Apply a penalty, returning whether the peer should be dropped.
    pub fn penalize(&self, reason: PenaltyReason) -> bool {
        self.score.lock().apply_penalty(reason)
    }

    pub fn score(&self) -> PeerScore {
        self.score.lock().clone()
    }

    // ----- lifecycle -----

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the peer is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.close();
        self.transport.disconnect(reason);
    }

    fn ensure_open(&self) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::PeerClosed(self.id.clone()));
        }
        Ok(())
    }

    // ----- requests -----

    pub fn request_headers_by_hash(
        &self,
        origin: H256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport
            .request_headers_by_hash(origin, amount, skip, reverse)
    }

    pub fn request_headers_by_number(
        &self,
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport
            .request_headers_by_number(origin, amount, skip, reverse)
    }

    pub fn request_bodies(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport.request_bodies(hashes)
    }

    pub fn request_receipts(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport.request_receipts(hashes)
    }

    pub fn request_node_data(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport.request_node_data(hashes)
    }

    pub fn request_pooled_transactions(&self, hashes: Vec<H256>) -> NetworkResult<()> {
        self.ensure_open()?;
        self.transport.request_pooled_transactions(hashes)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("head", &self.head())
            .field("seq", &self.seq())
            .finish()
    }
}

/// Transport that drops every request. Used for peers whose requests are
/// observed through other means and in tests.
#[derive(Debug, Default)]
pub struct NullTransport;

impl PeerTransport for NullTransport {
    fn request_headers_by_hash(&self, _: H256, _: u64, _: u64, _: bool) -> NetworkResult<()> {
        Ok(())
    }

    fn request_headers_by_number(&self, _: u64, _: u64, _: u64, _: bool) -> NetworkResult<()> {
        Ok(())
    }

    fn request_bodies(&self, _: Vec<H256>) -> NetworkResult<()> {
        Ok(())
    }

    fn request_receipts(&self, _: Vec<H256>) -> NetworkResult<()> {
        Ok(())
    }

    fn request_node_data(&self, _: Vec<H256>) -> NetworkResult<()> {
        Ok(())
    }

    fn request_pooled_transactions(&self, _: Vec<H256>) -> NetworkResult<()> {
        Ok(())
    }

    fn disconnect(&self, _: DisconnectReason) {}
}
