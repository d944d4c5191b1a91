use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ExchangeError, Result};

/// Content identifier: names a block, a DAG root, or a chain object by the
/// blake3 digest of its bytes. Stores trust an id only as far as `verifies`
/// does; a block whose bytes do not hash to its id never enters a store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    pub const LEN: usize = 32;

    /// Id of a block with exactly these bytes.
    pub fn of_block(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Whether `data` is the preimage this id names.
    pub fn verifies(&self, data: &[u8]) -> bool {
        // Compare through blake3's Hash so the check is constant-time.
        blake3::Hash::from(self.0) == blake3::hash(data)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full digest, used for persistence keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ExchangeError::Serialization(format!("content id: {e}")))?;
        let digest: [u8; Self::LEN] = bytes.as_slice().try_into().map_err(|_| {
            ExchangeError::Serialization(format!(
                "content id must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(digest))
    }

    /// Truncated digest for logs and error context.
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        format!("{}..{}", &hex[..8], &hex[hex.len() - 4..])
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentId").field(&self.short()).finish()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Identifier of a local block store allocated by the multistore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_verifies_its_preimage() {
        let data = b"some dag root";
        let id = ContentId::of_block(data);
        assert!(id.verifies(data));
        assert!(!id.verifies(b"some other bytes"));
        assert_eq!(id, ContentId::of_block(data));
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = ContentId::of_block(b"keyed by digest");
        let back = ContentId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentId::from_hex("abcd").is_err());
        assert!(ContentId::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_short_form() {
        let id = ContentId::of_block(b"x");
        let short = id.short();
        assert_eq!(short.len(), 8 + 2 + 4);
        assert!(id.to_hex().starts_with(&short[..8]));
    }
}
