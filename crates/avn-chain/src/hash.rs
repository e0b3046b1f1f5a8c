//! 32-byte hashes and the blake2b-256 helpers used for every identifier.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-byte blake2b-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct H256(pub [u8; 32]);

impl H256 {
    /// The all-zero hash (parent of genesis).
    pub const ZERO: H256 = H256([0u8; 32]);

    /// Create from a byte array.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, returning `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Check for the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", self.short())
    }
}

impl FromStr for H256 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
        H256::from_slice(&bytes).ok_or_else(|| format!("expected 32 bytes, got {}", bytes.len()))
    }
}

impl From<[u8; 32]> for H256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for H256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute blake2b-256 of the input.
pub fn blake2b256(data: &[u8]) -> H256 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    H256(bytes)
}

/// Commitment over an ordered list of hashes.
///
/// Used for transaction roots, uncle hashes and receipt roots. The empty list
/// commits to [`empty_root`].
pub fn derive_root<'a, I>(hashes: I) -> H256
where
    I: IntoIterator<Item = &'a H256>,
{
    let mut hasher = Blake2b::<U32>::new();
    for h in hashes {
        hasher.update(h.0);
    }
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    H256(bytes)
}

/// Root of an empty list.
pub fn empty_root() -> H256 {
    blake2b256(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_matches_empty_list() {
        let none: Vec<H256> = Vec::new();
        assert_eq!(derive_root(&none), empty_root());
    }

    #[test]
    fn test_root_depends_on_order() {
        let a = blake2b256(b"a");
        let b = blake2b256(b"b");
        assert_ne!(derive_root(&[a, b]), derive_root(&[b, a]));
    }

    #[test]
    fn test_parse_hex() {
        let h = blake2b256(b"checkpoint");
        let parsed: H256 = format!("0x{h}").parse().unwrap();
        assert_eq!(parsed, h);
        assert!("abcd".parse::<H256>().is_err());
    }
}
