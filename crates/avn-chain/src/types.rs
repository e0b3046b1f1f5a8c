//! Block, header, body, transaction, receipt and state-entry types.
//!
//! All identifiers are blake2b-256 hashes over a fixed little-endian
//! encoding. Bodies are tied to their headers through `tx_root` and
//! `uncle_hash`, receipts through `receipt_root`.

use crate::hash::{blake2b256, derive_root, empty_root, H256};
use crate::{ChainError, ChainResult};
use bytes::Bytes;

/// Total difficulty of a chain up to and including some block.
pub type TotalDifficulty = u128;

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Block number (height).
    pub number: u64,
    /// Hash of the parent header.
    pub parent_hash: H256,
    /// Root of the state trie after this block.
    pub state_root: H256,
    /// Commitment to the ordered transactions of the body.
    pub tx_root: H256,
    /// Commitment to the ordered uncle headers of the body.
    pub uncle_hash: H256,
    /// Commitment to the receipts of this block.
    pub receipt_root: H256,
    /// Block difficulty.
    pub difficulty: u128,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Arbitrary extra data.
    pub extra: Bytes,
}

impl Header {
    /// Canonical encoding used for hashing.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 32 * 5 + 16 + 8 + 4 + self.extra.len());
        out.extend_from_slice(&self.number.to_le_bytes());
        out.extend_from_slice(self.parent_hash.as_bytes());
        out.extend_from_slice(self.state_root.as_bytes());
        out.extend_from_slice(self.tx_root.as_bytes());
        out.extend_from_slice(self.uncle_hash.as_bytes());
        out.extend_from_slice(self.receipt_root.as_bytes());
        out.extend_from_slice(&self.difficulty.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.extra.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.extra);
        out
    }

    /// Header hash.
    pub fn hash(&self) -> H256 {
        blake2b256(&self.encode())
    }

    /// Whether the body committed to by this header is empty, in which case
    /// it never needs to be fetched.
    pub fn has_empty_body(&self) -> bool {
        let empty = empty_root();
        self.tx_root == empty && self.uncle_hash == empty
    }

    /// Whether this block has no receipts to fetch.
    pub fn has_empty_receipts(&self) -> bool {
        self.receipt_root == empty_root()
    }
}

/// A transaction. Opaque to the sync core apart from its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(nonce: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            nonce,
            payload: payload.into(),
        }
    }

    /// Transaction hash.
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(8 + self.payload.len());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        blake2b256(&buf)
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        8 + self.payload.len()
    }
}

/// Block body: ordered transactions and uncle headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<Header>,
}

impl Body {
    /// Root over the transaction hashes.
    pub fn tx_root(&self) -> H256 {
        let hashes: Vec<H256> = self.transactions.iter().map(Transaction::hash).collect();
        derive_root(&hashes)
    }

    /// Root over the uncle header hashes.
    pub fn uncle_hash(&self) -> H256 {
        let hashes: Vec<H256> = self.uncles.iter().map(Header::hash).collect();
        derive_root(&hashes)
    }

    /// Check that this body is the one committed to by `header`.
    pub fn matches(&self, header: &Header) -> bool {
        self.tx_root() == header.tx_root && self.uncle_hash() == header.uncle_hash
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.uncles.is_empty()
    }
}

/// A full block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub success: bool,
    pub gas_used: u64,
}

impl Receipt {
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(32 + 1 + 8);
        buf.extend_from_slice(self.tx_hash.as_bytes());
        buf.push(self.success as u8);
        buf.extend_from_slice(&self.gas_used.to_le_bytes());
        blake2b256(&buf)
    }
}

/// Root over a block's receipts.
pub fn receipts_root(receipts: &[Receipt]) -> H256 {
    let hashes: Vec<H256> = receipts.iter().map(Receipt::hash).collect();
    derive_root(&hashes)
}

/// One entry of the state trie, addressed by the hash of its encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateNode {
    pub children: Vec<H256>,
    pub value: Bytes,
}

impl StateNode {
    pub fn leaf(value: impl Into<Bytes>) -> Self {
        Self {
            children: Vec::new(),
            value: value.into(),
        }
    }

    pub fn branch(children: Vec<H256>, value: impl Into<Bytes>) -> Self {
        Self {
            children,
            value: value.into(),
        }
    }

    /// Encoding: child count (u32 LE), children, value.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(4 + 32 * self.children.len() + self.value.len());
        out.extend_from_slice(&(self.children.len() as u32).to_le_bytes());
        for child in &self.children {
            out.extend_from_slice(child.as_bytes());
        }
        out.extend_from_slice(&self.value);
        Bytes::from(out)
    }

    pub fn decode(data: &[u8]) -> ChainResult<Self> {
        if data.len() < 4 {
            return Err(ChainError::InvalidStateNode("truncated child count".into()));
        }
        let mut count = [0u8; 4];
        count.copy_from_slice(&data[..4]);
        let count = u32::from_le_bytes(count) as usize;
        let children_end = count
            .checked_mul(32)
            .and_then(|n| n.checked_add(4))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| ChainError::InvalidStateNode(format!("{count} children overflow")))?;
        let children = data[4..children_end]
            .chunks_exact(32)
            .filter_map(H256::from_slice)
            .collect();
        Ok(Self {
            children,
            value: Bytes::copy_from_slice(&data[children_end..]),
        })
    }

    pub fn hash(&self) -> H256 {
        blake2b256(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64) -> Header {
        Header {
            number,
            parent_hash: H256::ZERO,
            state_root: H256::ZERO,
            tx_root: empty_root(),
            uncle_hash: empty_root(),
            receipt_root: empty_root(),
            difficulty: 1,
            timestamp: 0,
            extra: Bytes::new(),
        }
    }

    #[test]
    fn test_hash_covers_extra() {
        let a = header(1);
        let mut b = header(1);
        b.extra = Bytes::from_static(b"fork");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_empty_body_matches_empty_header() {
        let h = header(3);
        assert!(h.has_empty_body());
        assert!(Body::default().matches(&h));
    }

    #[test]
    fn test_body_mismatch_detected() {
        let h = header(3);
        let body = Body {
            transactions: vec![Transaction::new(1, vec![1, 2, 3])],
            uncles: vec![],
        };
        assert!(!body.matches(&h));
    }

    #[test]
    fn test_state_node_decode() {
        let child = StateNode::leaf(vec![7u8; 5]);
        let node = StateNode::branch(vec![child.hash()], vec![1u8]);
        let decoded = StateNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded.children, vec![child.hash()]);
        assert_eq!(decoded.hash(), node.hash());
    }

    #[test]
    fn test_state_node_rejects_garbage() {
        assert!(StateNode::decode(&[1, 0]).is_err());
        assert!(StateNode::decode(&[9, 0, 0, 0, 1, 2]).is_err());
    }
}
