//! In-memory chain store.

use crate::hash::H256;
use crate::store::ChainStore;
use crate::types::{receipts_root, Block, Body, Header, Receipt, StateNode, TotalDifficulty};
use crate::{ChainError, ChainResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    headers: HashMap<H256, Header>,
    td: HashMap<H256, TotalDifficulty>,
    canonical: BTreeMap<u64, H256>,
    bodies: HashMap<H256, Body>,
    receipts: HashMap<H256, Vec<Receipt>>,
    /// Blocks whose post-state is available.
    full: HashSet<H256>,
    state: HashMap<H256, Bytes>,
    state_roots: HashSet<H256>,
    genesis: H256,
    head_header: H256,
    head_fast: H256,
    head_block: H256,
}

impl Inner {
    fn header(&self, hash: &H256) -> ChainResult<&Header> {
        self.headers
            .get(hash)
            .ok_or(ChainError::UnknownHeader(*hash))
    }

    fn td_of(&self, hash: &H256) -> TotalDifficulty {
        self.td.get(hash).copied().unwrap_or_default()
    }

    fn is_canonical(&self, header: &Header, hash: &H256) -> bool {
        self.canonical.get(&header.number) == Some(hash)
    }

    fn insert_header(&mut self, header: &Header) -> ChainResult<bool> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Ok(false);
        }
        let parent = self
            .headers
            .get(&header.parent_hash)
            .ok_or(ChainError::UnknownParent {
                number: header.number,
                parent: header.parent_hash,
            })?;
        if parent.number.checked_add(1) != Some(header.number) {
            return Err(ChainError::NonContiguous {
                number: header.number,
            });
        }
        let td = self
            .td_of(&header.parent_hash)
            .checked_add(header.difficulty)
            .ok_or(ChainError::DifficultyOverflow {
                number: header.number,
            })?;
        self.td.insert(hash, td);
        self.headers.insert(hash, header.clone());
        Ok(true)
    }

    /// Make `hash` the header head if it carries more total difficulty.
    fn maybe_reorg(&mut self, hash: H256) {
        if self.td_of(&hash) <= self.td_of(&self.head_header) {
            return;
        }
        let Some(head) = self.headers.get(&hash).cloned() else {
            return;
        };
        let _ = self.canonical.split_off(&(head.number + 1));
        let mut cursor = head;
        let mut cursor_hash = hash;
        loop {
            if self.canonical.get(&cursor.number) == Some(&cursor_hash) {
                break;
            }
            self.canonical.insert(cursor.number, cursor_hash);
            if cursor.number == 0 {
                break;
            }
            let parent_hash = cursor.parent_hash;
            match self.headers.get(&parent_hash) {
                Some(parent) => {
                    cursor = parent.clone();
                    cursor_hash = parent_hash;
                }
                None => break,
            }
        }
        self.head_header = hash;
        self.head_block = self.canonical_ancestor(self.head_block);
        self.head_fast = self.canonical_ancestor(self.head_fast);
    }

    /// Walk back from `hash` until reaching a canonical block.
    fn canonical_ancestor(&self, mut hash: H256) -> H256 {
        while let Some(header) = self.headers.get(&hash) {
            if self.is_canonical(header, &hash) || header.number == 0 {
                break;
            }
            hash = header.parent_hash;
        }
        hash
    }

    fn advance_block_heads(&mut self, hash: H256, full: bool) {
        let Some(header) = self.headers.get(&hash) else {
            return;
        };
        if !self.is_canonical(header, &hash) {
            return;
        }
        let td = self.td_of(&hash);
        if td > self.td_of(&self.head_fast) {
            self.head_fast = hash;
        }
        if full && td > self.td_of(&self.head_block) {
            self.head_block = hash;
        }
    }

    fn state_complete(&self, root: &H256) -> bool {
        let mut stack = vec![*root];
        let mut seen = HashSet::new();
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            let Some(data) = self.state.get(&hash) else {
                return false;
            };
            match StateNode::decode(data) {
                Ok(node) => stack.extend(node.children),
                Err(_) => return false,
            }
        }
        true
    }
}

/// Chain store held entirely in memory behind a single lock.
pub struct MemoryChain {
    inner: RwLock<Inner>,
}

impl MemoryChain {
    /// Create a chain from a genesis block and its state trie.
    pub fn new(genesis: Block, genesis_state: Vec<StateNode>) -> Self {
        let hash = genesis.hash();
        let mut inner = Inner::default();
        inner.td.insert(hash, genesis.header.difficulty);
        inner.canonical.insert(0, hash);
        inner.state_roots.insert(genesis.header.state_root);
        for node in genesis_state {
            inner.state.insert(node.hash(), node.encode());
        }
        inner.bodies.insert(hash, genesis.body);
        inner.receipts.insert(hash, Vec::new());
        inner.headers.insert(hash, genesis.header);
        inner.full.insert(hash);
        inner.genesis = hash;
        inner.head_header = hash;
        inner.head_fast = hash;
        inner.head_block = hash;
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Number of stored state nodes.
    pub fn state_node_count(&self) -> usize {
        self.inner.read().state.len()
    }
}

impl ChainStore for MemoryChain {
    fn genesis(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.genesis].clone()
    }

    fn has_header(&self, hash: &H256, number: u64) -> bool {
        self.inner
            .read()
            .headers
            .get(hash)
            .is_some_and(|h| h.number == number)
    }

    fn has_block(&self, hash: &H256, number: u64) -> bool {
        let inner = self.inner.read();
        inner.full.contains(hash) && inner.headers.get(hash).is_some_and(|h| h.number == number)
    }

    fn has_fast_block(&self, hash: &H256, number: u64) -> bool {
        let inner = self.inner.read();
        let stored = inner.full.contains(hash)
            || (inner.bodies.contains_key(hash) && inner.receipts.contains_key(hash));
        stored && inner.headers.get(hash).is_some_and(|h| h.number == number)
    }

    fn header_by_hash(&self, hash: &H256) -> Option<Header> {
        self.inner.read().headers.get(hash).cloned()
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        let inner = self.inner.read();
        inner
            .canonical
            .get(&number)
            .and_then(|hash| inner.headers.get(hash))
            .cloned()
    }

    fn body_by_hash(&self, hash: &H256) -> Option<Body> {
        self.inner.read().bodies.get(hash).cloned()
    }

    fn receipts_by_hash(&self, hash: &H256) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    fn total_difficulty(&self, hash: &H256) -> Option<TotalDifficulty> {
        self.inner.read().td.get(hash).copied()
    }

    fn current_header(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.head_header].clone()
    }

    fn current_block(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.head_block].clone()
    }

    fn current_fast_block(&self) -> Header {
        let inner = self.inner.read();
        inner.headers[&inner.head_fast].clone()
    }

    fn insert_headers(&self, headers: &[Header]) -> ChainResult<usize> {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        let mut prev: Option<H256> = None;
        for header in headers {
            if let Some(prev) = prev {
                if header.parent_hash != prev {
                    return Err(ChainError::NonContiguous {
                        number: header.number,
                    });
                }
            }
            if inner.insert_header(header)? {
                inserted += 1;
            }
            prev = Some(header.hash());
        }
        if let Some(last) = prev {
            inner.maybe_reorg(last);
        }
        debug!(count = headers.len(), inserted, "Inserted headers");
        Ok(inserted)
    }

    fn insert_bodies(&self, blocks: Vec<Block>) -> ChainResult<usize> {
        let mut inner = self.inner.write();
        let mut imported = 0;
        for block in blocks {
            let hash = block.hash();
            let number = block.number();
            if inner.full.contains(&hash) {
                continue;
            }
            if !block.body.matches(&block.header) {
                return Err(ChainError::BodyMismatch { number });
            }
            if !inner.full.contains(&block.header.parent_hash) {
                return Err(match inner.headers.get(&block.header.parent_hash) {
                    Some(parent) => ChainError::MissingState {
                        number: parent.number,
                        root: parent.state_root,
                    },
                    None => ChainError::UnknownParent {
                        number,
                        parent: block.header.parent_hash,
                    },
                });
            }
            inner.insert_header(&block.header)?;
            inner.state_roots.insert(block.header.state_root);
            inner.bodies.insert(hash, block.body);
            inner.full.insert(hash);
            inner.maybe_reorg(hash);
            inner.advance_block_heads(hash, true);
            imported += 1;
        }
        Ok(imported)
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> ChainResult<usize> {
        let mut inner = self.inner.write();
        let mut stored = 0;
        for (block, receipts) in blocks.into_iter().zip(receipts) {
            let hash = block.hash();
            let number = block.number();
            if !inner.headers.contains_key(&hash) {
                return Err(ChainError::UnknownHeader(hash));
            }
            if !block.body.matches(&block.header) {
                return Err(ChainError::BodyMismatch { number });
            }
            if receipts_root(&receipts) != block.header.receipt_root {
                return Err(ChainError::ReceiptMismatch { number });
            }
            inner.bodies.insert(hash, block.body);
            inner.receipts.insert(hash, receipts);
            inner.advance_block_heads(hash, false);
            stored += 1;
        }
        Ok(stored)
    }

    fn has_state_node(&self, hash: &H256) -> bool {
        let inner = self.inner.read();
        inner.state.contains_key(hash) || inner.state_roots.contains(hash)
    }

    fn state_node(&self, hash: &H256) -> Option<Bytes> {
        self.inner.read().state.get(hash).cloned()
    }

    fn write_state_node(&self, hash: H256, data: Bytes) -> ChainResult<()> {
        self.inner.write().state.insert(hash, data);
        Ok(())
    }

    fn commit_pivot(&self, hash: &H256) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let header = inner.header(hash)?.clone();
        if !inner.bodies.contains_key(hash) {
            return Err(ChainError::UnknownHeader(*hash));
        }
        if !inner.state_complete(&header.state_root) {
            return Err(ChainError::MissingState {
                number: header.number,
                root: header.state_root,
            });
        }
        inner.state_roots.insert(header.state_root);
        inner.full.insert(*hash);
        inner.advance_block_heads(*hash, true);
        info!(number = header.number, hash = %hash.short(), "Committed pivot block");
        Ok(())
    }

    fn set_head(&self, number: u64) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let removed = inner.canonical.split_off(&(number + 1));
        for hash in removed.values() {
            inner.headers.remove(hash);
            inner.td.remove(hash);
            inner.bodies.remove(hash);
            inner.receipts.remove(hash);
            inner.full.remove(hash);
        }
        let (_, head) = inner
            .canonical
            .iter()
            .next_back()
            .map(|(n, h)| (*n, *h))
            .ok_or_else(|| ChainError::Storage("canonical chain empty".into()))?;
        inner.head_header = head;
        if !inner.headers.contains_key(&inner.head_fast) {
            let mut cursor = head;
            while !inner.full.contains(&cursor)
                && !(inner.bodies.contains_key(&cursor) && inner.receipts.contains_key(&cursor))
            {
                cursor = inner.header(&cursor)?.parent_hash;
            }
            inner.head_fast = cursor;
        }
        if !inner.headers.contains_key(&inner.head_block) {
            let mut cursor = head;
            while !inner.full.contains(&cursor) {
                cursor = inner.header(&cursor)?.parent_hash;
            }
            inner.head_block = cursor;
        }
        info!(number, removed = removed.len(), "Rewound chain head");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::empty_root;
    use crate::types::Transaction;

    fn genesis() -> Block {
        let state = StateNode::leaf(b"genesis".to_vec());
        Block::new(
            Header {
                number: 0,
                parent_hash: H256::ZERO,
                state_root: state.hash(),
                tx_root: empty_root(),
                uncle_hash: empty_root(),
                receipt_root: empty_root(),
                difficulty: 1,
                timestamp: 0,
                extra: Bytes::new(),
            },
            Body::default(),
        )
    }

    fn chain() -> MemoryChain {
        let state = StateNode::leaf(b"genesis".to_vec());
        MemoryChain::new(genesis(), vec![state])
    }

    fn extend(parent: &Header, count: usize, difficulty: u128, tag: u8) -> Vec<Block> {
        let mut out = Vec::new();
        let mut parent = parent.clone();
        for _ in 0..count {
            let body = Body {
                transactions: vec![Transaction::new(parent.number, vec![tag])],
                uncles: vec![],
            };
            let header = Header {
                number: parent.number + 1,
                parent_hash: parent.hash(),
                state_root: StateNode::leaf(vec![tag, parent.number as u8]).hash(),
                tx_root: body.tx_root(),
                uncle_hash: body.uncle_hash(),
                receipt_root: empty_root(),
                difficulty,
                timestamp: parent.timestamp + 1,
                extra: Bytes::from(vec![tag]),
            };
            parent = header.clone();
            out.push(Block::new(header, body));
        }
        out
    }

    #[test]
    fn test_headers_then_bodies() {
        let chain = chain();
        let blocks = extend(&chain.genesis(), 5, 2, 1);
        let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();

        assert_eq!(chain.insert_headers(&headers).unwrap(), 5);
        assert_eq!(chain.current_header().number, 5);
        assert_eq!(chain.current_block().number, 0);

        assert_eq!(chain.insert_bodies(blocks.clone()).unwrap(), 5);
        assert_eq!(chain.current_block().number, 5);
        assert!(chain.has_block(&blocks[4].hash(), 5));
        assert_eq!(chain.total_difficulty(&blocks[4].hash()), Some(11));
    }

    #[test]
    fn test_difficulty_overflow_rejected() {
        let chain = chain();
        let heavy = extend(&chain.genesis(), 1, u128::MAX, 7);

        assert_eq!(
            chain.insert_headers(&[heavy[0].header.clone()]),
            Err(ChainError::DifficultyOverflow { number: 1 })
        );
        assert_eq!(chain.current_header().number, 0);
        assert!(!chain.has_header(&heavy[0].hash(), 1));
        assert_eq!(chain.total_difficulty(&heavy[0].hash()), None);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let chain = chain();
        let blocks = extend(&chain.genesis(), 3, 1, 1);
        let err = chain.insert_headers(&[blocks[2].header.clone()]).unwrap_err();
        assert!(matches!(err, ChainError::UnknownParent { number: 3, .. }));
    }

    #[test]
    fn test_body_mismatch_rejected() {
        let chain = chain();
        let mut blocks = extend(&chain.genesis(), 1, 1, 1);
        blocks[0].body.transactions.clear();
        assert!(matches!(
            chain.insert_bodies(blocks),
            Err(ChainError::BodyMismatch { number: 1 })
        ));
    }

    #[test]
    fn test_heavier_fork_reorgs() {
        let chain = chain();
        let light = extend(&chain.genesis(), 4, 1, 1);
        chain.insert_bodies(light.clone()).unwrap();
        let heavy = extend(&light[0].header, 2, 10, 2);
        chain.insert_bodies(heavy.clone()).unwrap();

        assert_eq!(chain.current_block().hash(), heavy[1].hash());
        assert_eq!(
            chain.header_by_number(2).map(|h| h.hash()),
            Some(heavy[0].hash())
        );
        assert!(chain.header_by_number(4).is_none());
    }

    #[test]
    fn test_pivot_requires_state() {
        let chain = chain();
        let blocks = extend(&chain.genesis(), 2, 1, 1);
        let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();
        chain.insert_headers(&headers).unwrap();
        chain
            .insert_receipt_chain(blocks.clone(), vec![Vec::new(), Vec::new()])
            .unwrap();
        assert_eq!(chain.current_fast_block().number, 2);

        let pivot = blocks[1].hash();
        assert!(matches!(
            chain.commit_pivot(&pivot),
            Err(ChainError::MissingState { number: 2, .. })
        ));

        let node = StateNode::leaf(vec![1u8, 1]);
        chain.write_state_node(node.hash(), node.encode()).unwrap();
        chain.commit_pivot(&pivot).unwrap();
        assert_eq!(chain.current_block().number, 2);
    }

    #[test]
    fn test_set_head_rewinds() {
        let chain = chain();
        let blocks = extend(&chain.genesis(), 6, 1, 1);
        let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();
        chain.insert_headers(&headers).unwrap();
        chain.insert_bodies(blocks[..2].to_vec()).unwrap();

        chain.set_head(3).unwrap();
        assert_eq!(chain.current_header().number, 3);
        assert_eq!(chain.current_block().number, 2);
        assert!(!chain.has_header(&blocks[4].hash(), 5));
    }
}
