//! Inbound protocol packets.

use avn_chain::{Block, Body, Header, Receipt, TotalDifficulty, Transaction, H256};
use bytes::Bytes;

/// A packet received on a peer connection after the handshake.
#[derive(Debug, Clone)]
pub enum Packet {
    /// Handshake status. Only valid once, before any other packet.
    Status {
        version: u32,
        td: TotalDifficulty,
        head: H256,
        genesis: H256,
    },
    /// Announcement of new block hashes with their numbers.
    NewBlockHashes(Vec<(H256, u64)>),
    /// Full block propagation with the sender's total difficulty.
    NewBlock {
        block: Box<Block>,
        td: TotalDifficulty,
    },
    BlockHeaders(Vec<Header>),
    BlockBodies(Vec<Body>),
    Receipts(Vec<Vec<Receipt>>),
    NodeData(Vec<Bytes>),
    NewPooledTransactionHashes(Vec<H256>),
    Transactions(Vec<Transaction>),
    PooledTransactions(Vec<Transaction>),
}

impl Packet {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "Status",
            Self::NewBlockHashes(_) => "NewBlockHashes",
            Self::NewBlock { .. } => "NewBlock",
            Self::BlockHeaders(_) => "BlockHeaders",
            Self::BlockBodies(_) => "BlockBodies",
            Self::Receipts(_) => "Receipts",
            Self::NodeData(_) => "NodeData",
            Self::NewPooledTransactionHashes(_) => "NewPooledTransactionHashes",
            Self::Transactions(_) => "Transactions",
            Self::PooledTransactions(_) => "PooledTransactions",
        }
    }
}
