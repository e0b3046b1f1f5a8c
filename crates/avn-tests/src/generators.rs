//! Test data generators for integration tests.
//!
//! Deterministic chains with bodies, receipts and per-block state, forks of
//! them, and transactions for pool tests.

use avn_chain::{
    empty_root, receipts_root, Block, Body, ChainStore, Header, MemoryChain, Receipt, StateNode,
    TotalDifficulty, Transaction, H256,
};
use avn_network::PeerId;
use bytes::Bytes;
use std::sync::Arc;

/// Peer id derived from a small number.
pub fn peer_id(n: u8) -> PeerId {
    PeerId(vec![0xAE, n])
}

/// `count` distinct transactions for a given seed.
pub fn test_transactions(seed: u8, count: u64) -> Vec<Transaction> {
    (0..count)
        .map(|i| Transaction::new((u64::from(seed) << 32) | i, vec![0x77, seed, i as u8]))
        .collect()
}

/// A generated chain: blocks with matching receipts and state entries.
#[derive(Clone)]
pub struct TestChain {
    pub blocks: Vec<Block>,
    pub receipts: Vec<Vec<Receipt>>,
    pub states: Vec<Vec<StateNode>>,
}

impl TestChain {
    /// Genesis followed by `len` blocks of difficulty 1.
    pub fn new(len: u64) -> Self {
        Self::genesis().extend(len, 0, 1)
    }

    /// The genesis block every generated chain starts from.
    pub fn genesis() -> Self {
        let state = vec![StateNode::leaf(b"avn-tests genesis".to_vec())];
        let header = Header {
            number: 0,
            parent_hash: H256::ZERO,
            state_root: state[0].hash(),
            tx_root: empty_root(),
            uncle_hash: empty_root(),
            receipt_root: empty_root(),
            difficulty: 1,
            timestamp: 1_600_000_000,
            extra: Bytes::new(),
        };
        Self {
            blocks: vec![Block::new(header, Body::default())],
            receipts: vec![Vec::new()],
            states: vec![state],
        }
    }

    /// A copy grown by `len` blocks. `seed` makes sibling branches differ.
    pub fn extend(&self, len: u64, seed: u8, difficulty: u128) -> Self {
        let mut chain = self.clone();
        for _ in 0..len {
            let (block, receipts, state) = next_block(&chain.head().header, seed, difficulty);
            chain.blocks.push(block);
            chain.receipts.push(receipts);
            chain.states.push(state);
        }
        chain
    }

    /// Branch off at `number` and grow `len` blocks.
    pub fn fork(&self, number: u64, len: u64, seed: u8, difficulty: u128) -> Self {
        self.truncated(number).extend(len, seed, difficulty)
    }

    pub fn truncated(&self, number: u64) -> Self {
        let keep = number as usize + 1;
        Self {
            blocks: self.blocks[..keep].to_vec(),
            receipts: self.receipts[..keep].to_vec(),
            states: self.states[..keep].to_vec(),
        }
    }

    pub fn head(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn td(&self) -> TotalDifficulty {
        self.td_at(self.head().number())
    }

    /// Total difficulty up to and including block `number`.
    pub fn td_at(&self, number: u64) -> TotalDifficulty {
        self.blocks[..=number as usize]
            .iter()
            .map(|b| b.header.difficulty)
            .sum()
    }

    /// A store holding the whole chain with receipts and state.
    pub fn store(&self) -> Arc<MemoryChain> {
        self.store_upto(self.head().number())
    }

    /// A store holding blocks up to `number`.
    pub fn store_upto(&self, number: u64) -> Arc<MemoryChain> {
        let chain = MemoryChain::new(self.blocks[0].clone(), self.states[0].clone());
        let end = number as usize + 1;
        for node in self.states[1..end].iter().flatten() {
            chain
                .write_state_node(node.hash(), node.encode())
                .expect("write generated state");
        }
        let blocks = self.blocks[1..end].to_vec();
        chain
            .insert_bodies(blocks.clone())
            .expect("insert generated blocks");
        chain
            .insert_receipt_chain(blocks, self.receipts[1..end].to_vec())
            .expect("insert generated receipts");
        Arc::new(chain)
    }
}

fn next_block(
    parent: &Header,
    seed: u8,
    difficulty: u128,
) -> (Block, Vec<Receipt>, Vec<StateNode>) {
    let number = parent.number + 1;
    let transactions: Vec<Transaction> = if number % 4 == 0 {
        Vec::new()
    } else {
        (0..1 + number % 3)
            .map(|i| Transaction::new(number * 100 + i, vec![seed, number as u8, i as u8]))
            .collect()
    };
    let receipts: Vec<Receipt> = transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| Receipt {
            tx_hash: tx.hash(),
            success: i % 5 != 4,
            gas_used: 21_000 + i as u64,
        })
        .collect();

    let leaf = StateNode::leaf(format!("account-{seed}-{number}").into_bytes());
    let storage = StateNode::leaf(format!("storage-{seed}-{number}").into_bytes());
    let root = StateNode::branch(vec![leaf.hash(), storage.hash()], vec![seed, 0x01]);

    let body = Body {
        transactions,
        uncles: Vec::new(),
    };
    let header = Header {
        number,
        parent_hash: parent.hash(),
        state_root: root.hash(),
        tx_root: body.tx_root(),
        uncle_hash: body.uncle_hash(),
        receipt_root: receipts_root(&receipts),
        difficulty,
        timestamp: parent.timestamp + 12,
        extra: Bytes::from(vec![seed]),
    };
    (Block::new(header, body), receipts, vec![root, leaf, storage])
}
