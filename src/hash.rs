//! 32-byte content identifier.
//!
//! Every stored chunk is named by the SHA-256 of its plaintext. Unlike the
//! xxh3 fingerprint the original dedup prototype used for quick identity
//! checks, content addressing here has to be collision-resistant: two
//! different chunks silently sharing a name would corrupt every backup that
//! references either one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::BkError;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const LEN: usize = 32;
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn of(plaintext: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(plaintext);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Hash(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BkError> {
        if bytes.len() != Self::LEN {
            return Err(BkError::InvalidHash(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Hash(out))
    }

    pub fn from_hex(s: &str) -> Result<Self, BkError> {
        let bytes =
            hex::decode(s).map_err(|e| BkError::InvalidHash(format!("not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl std::str::FromStr for Hash {
    type Err = BkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_plaintext_same_hash() {
        let a = Hash::of(b"the quick brown fox");
        let b = Hash::of(b"the quick brown fox");
        assert_eq!(a, b);
    }

    #[test]
    fn different_plaintext_different_hash() {
        let a = Hash::of(b"alpha");
        let b = Hash::of(b"beta");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::of(b"round trip me");
        let s = h.to_hex();
        assert_eq!(Hash::from_hex(&s).unwrap(), h);
    }

    #[test]
    fn zero_is_reserved() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::of(b"x").is_zero());
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Hash::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, BkError::InvalidHash(_)));
    }

    #[test]
    fn total_ordering_is_byte_order() {
        let a = Hash::from_bytes(&[0u8; 32]).unwrap();
        let mut high = [0u8; 32];
        high[0] = 1;
        let b = Hash::from_bytes(&high).unwrap();
        assert!(a < b);
    }
}
