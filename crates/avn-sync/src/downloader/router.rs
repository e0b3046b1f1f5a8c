//! Routing of replies to the request waiting for them.

use avn_chain::{Body, Header, Receipt};
use avn_network::{PeerId, RequestKind};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// A reply delivered by the protocol handler.
#[derive(Debug, Clone)]
pub enum Delivery {
    Headers(Vec<Header>),
    Bodies(Vec<Body>),
    Receipts(Vec<Vec<Receipt>>),
    NodeData(Vec<Bytes>),
}

impl Delivery {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Headers(_) => RequestKind::Headers,
            Self::Bodies(_) => RequestKind::Bodies,
            Self::Receipts(_) => RequestKind::Receipts,
            Self::NodeData(_) => RequestKind::State,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Headers(v) => v.len(),
            Self::Bodies(v) => v.len(),
            Self::Receipts(v) => v.len(),
            Self::NodeData(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Slot = (PeerId, RequestKind);

/// One waiting slot per (peer, kind). Reservations guarantee a peer has at
/// most one outstanding request per kind, so replies can be matched without
/// request ids.
#[derive(Debug, Default)]
pub(crate) struct DeliveryRouter {
    slots: Mutex<HashMap<Slot, (u64, oneshot::Sender<Delivery>)>>,
    next_id: Mutex<u64>,
}

impl DeliveryRouter {
    /// Register interest in the next reply of `kind` from `peer`.
    pub fn expect(&self, peer: &PeerId, kind: RequestKind) -> PendingReply<'_> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let key = (peer.clone(), kind);
        self.slots.lock().insert(key.clone(), (id, tx));
        PendingReply {
            router: self,
            key,
            id,
            rx: Some(rx),
        }
    }

    /// Hand a reply to its waiting request. Gives the reply back if nothing
    /// is waiting.
    pub fn deliver(&self, peer: &PeerId, delivery: Delivery) -> Result<(), Delivery> {
        let key = (peer.clone(), delivery.kind());
        let slot = self.slots.lock().remove(&key);
        match slot {
            Some((_, tx)) => tx.send(delivery),
            None => Err(delivery),
        }
    }

    pub fn is_expecting(&self, peer: &PeerId, kind: RequestKind) -> bool {
        self.slots.lock().contains_key(&(peer.clone(), kind))
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Receiving end of an expected reply. Unregisters itself on drop.
pub(crate) struct PendingReply<'a> {
    router: &'a DeliveryRouter,
    key: Slot,
    id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl PendingReply<'_> {
    /// Wait for the reply. `None` if the slot was torn down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        let mut slots = self.router.slots.lock();
        if slots.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            slots.remove(&self.key);
        }
    }
}
