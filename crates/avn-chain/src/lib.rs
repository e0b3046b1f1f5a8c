//! # avn-chain
//!
//! Chain primitives and the collaborator interfaces of the sync core.
//!
//! This crate provides:
//! - Header, body, block, receipt and state-node types with blake2b-256 ids
//! - The `ChainStore` trait and an in-memory implementation
//! - The `Engine` header verification trait and a structural verifier

mod engine;
mod error;
mod hash;
mod memory;
mod store;
mod types;

pub use engine::{BasicEngine, Engine, MAX_EXTRA_SIZE};
pub use error::{ChainError, ChainResult, ConsensusError, ConsensusResult};
pub use hash::{blake2b256, derive_root, empty_root, H256};
pub use memory::MemoryChain;
pub use store::ChainStore;
pub use types::{
    receipts_root, Block, Body, Header, Receipt, StateNode, TotalDifficulty, Transaction,
};
