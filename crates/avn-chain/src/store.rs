//! Chain store interface consumed by the sync core.

use crate::hash::H256;
use crate::types::{Block, Body, Header, Receipt, TotalDifficulty};
use crate::ChainResult;
use bytes::Bytes;

/// Access to the local chain.
///
/// Three heads are tracked: the header head (longest verified header chain),
/// the fast head (blocks with bodies and receipts) and the block head (blocks
/// with state, i.e. fully imported). All mutations are atomic per call.
pub trait ChainStore: Send + Sync {
    /// The genesis header.
    fn genesis(&self) -> Header;

    /// Header known under this hash and number.
    fn has_header(&self, hash: &H256, number: u64) -> bool;

    /// Fully imported block (body and state) known.
    fn has_block(&self, hash: &H256, number: u64) -> bool;

    /// Block with body and receipts known.
    fn has_fast_block(&self, hash: &H256, number: u64) -> bool;

    fn header_by_hash(&self, hash: &H256) -> Option<Header>;

    /// Canonical header at `number`.
    fn header_by_number(&self, number: u64) -> Option<Header>;

    fn body_by_hash(&self, hash: &H256) -> Option<Body>;

    fn receipts_by_hash(&self, hash: &H256) -> Option<Vec<Receipt>>;

    fn total_difficulty(&self, hash: &H256) -> Option<TotalDifficulty>;

    /// Head of the header chain.
    fn current_header(&self) -> Header;

    /// Header of the head full block.
    fn current_block(&self) -> Header;

    /// Header of the head fast block.
    fn current_fast_block(&self) -> Header;

    /// Insert a linked batch of headers whose first parent is known.
    /// Returns the number of headers not previously known.
    fn insert_headers(&self, headers: &[Header]) -> ChainResult<usize>;

    /// Fully import blocks on top of known full blocks.
    fn insert_bodies(&self, blocks: Vec<Block>) -> ChainResult<usize>;

    /// Store bodies and receipts for known headers without state.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> ChainResult<usize>;

    fn has_state_node(&self, hash: &H256) -> bool;

    fn state_node(&self, hash: &H256) -> Option<Bytes>;

    fn write_state_node(&self, hash: H256, data: Bytes) -> ChainResult<()>;

    /// Promote a fast block whose state trie is complete to the block head.
    fn commit_pivot(&self, hash: &H256) -> ChainResult<()>;

    /// Rewind every head to at most `number`, discarding data above it.
    fn set_head(&self, number: u64) -> ChainResult<()>;
}
