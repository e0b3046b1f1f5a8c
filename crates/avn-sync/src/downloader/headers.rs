//! Re-sequencing of header batches that arrive out of order.

use avn_chain::{Header, TotalDifficulty};
use avn_network::PeerId;
use std::collections::BTreeMap;

/// Contiguous run of headers and the peer that served it.
#[derive(Debug, Clone)]
pub struct HeaderBatch {
    pub peer: PeerId,
    pub headers: Vec<Header>,
}

impl HeaderBatch {
    pub fn first(&self) -> u64 {
        self.headers.first().map_or(0, |h| h.number)
    }

    pub fn last(&self) -> u64 {
        self.headers.last().map_or(0, |h| h.number)
    }
}

/// Buffers batches keyed by first block number and releases them only
/// when they extend the committed tip.
#[derive(Debug)]
pub struct HeaderQueue {
    tip: Header,
    td: TotalDifficulty,
    pending: BTreeMap<u64, HeaderBatch>,
}

impl HeaderQueue {
    pub fn new(tip: Header, td: TotalDifficulty) -> Self {
        Self {
            tip,
            td,
            pending: BTreeMap::new(),
        }
    }

    /// Buffer a batch. Parts at or below the tip are trimmed; empty and
    /// fully committed batches are ignored. A batch starting where another
    /// one already starts replaces it.
    pub fn insert(&mut self, mut batch: HeaderBatch) -> bool {
        let committed = self.tip.number;
        batch.headers.retain(|h| h.number > committed);
        if batch.headers.is_empty() {
            return false;
        }
        self.pending.insert(batch.first(), batch);
        true
    }

    /// The buffered batch that directly extends the tip, if any.
    pub fn pop_ready(&mut self) -> Option<HeaderBatch> {
        let next = self.tip.number + 1;
        loop {
            let (&first, _) = self.pending.first_key_value()?;
            if first > next {
                return None;
            }
            let batch = self.pending.remove(&first)?;
            if first == next {
                return Some(batch);
            }
            // Overlapping a committed range: keep only the new tail.
            let mut batch = batch;
            batch.headers.retain(|h| h.number >= next);
            if !batch.headers.is_empty() {
                self.pending.insert(batch.first(), batch);
            }
        }
    }

    /// Total difficulty after appending `headers`, `None` on overflow.
    pub fn td_with(&self, headers: &[Header]) -> Option<TotalDifficulty> {
        headers
            .iter()
            .try_fold(self.td, |td, h| td.checked_add(h.difficulty))
    }

    /// Record a verified batch as committed.
    pub fn advance(&mut self, headers: &[Header]) {
        self.td = self.td_with(headers).unwrap_or(TotalDifficulty::MAX);
        if let Some(last) = headers.last() {
            self.tip = last.clone();
        }
    }

    pub fn tip(&self) -> &Header {
        &self.tip
    }

    pub fn committed(&self) -> u64 {
        self.tip.number
    }

    pub fn td(&self) -> TotalDifficulty {
        self.td
    }

    pub fn buffered(&self) -> usize {
        self.pending.values().map(|b| b.headers.len()).sum()
    }

    /// First buffered block number above a gap.
    pub fn next_buffered(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
