//! Content hashing using BLAKE3
//!
//! Every fragment and every reconstructed file carries a [`ContentHash`];
//! integrity checks compare a freshly computed hash with the recorded one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content hash using BLAKE3 (32 bytes), serialized as base58 text
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash data and return content hash
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to base58 string (shorter, URL-safe)
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self, String> {
        let bytes = bs58::decode(s).into_vec().map_err(|e| e.to_string())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("expected 32 bytes in content hash '{}'", s))?;
        Ok(Self(arr))
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::hash(data) == *self
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_base58()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base58(&value)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_base58())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let data = b"fragment payload";
        let hash = ContentHash::hash(data);

        assert!(hash.verify(data));
        assert!(!hash.verify(b"tampered payload"));
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_hash_serializes_as_text() {
        let hash = ContentHash::hash(b"test data");

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_base58()));

        let parsed: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_from_base58_rejects_short_input() {
        let short = bs58::encode([1u8, 2, 3]).into_string();
        assert!(ContentHash::from_base58(&short).is_err());
    }
}
