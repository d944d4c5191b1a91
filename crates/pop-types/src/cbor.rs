//! CBOR helpers wrapping [`ciborium`]. Every wire message and every persisted
//! payment-channel record goes through these two functions so the encoding
//! stays self-describing and stable across versions.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ExchangeError, Result};

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ExchangeError::Serialization(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data)
        .map_err(|e| ExchangeError::Serialization(format!("cbor decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        size: u64,
    }

    #[test]
    fn test_roundtrip() {
        let probe = Probe {
            name: "root".into(),
            size: 256_000,
        };
        let bytes = to_vec(&probe).unwrap();
        let back: Probe = from_slice(&bytes).unwrap();
        assert_eq!(probe, back);
    }

    #[test]
    fn test_decode_garbage() {
        let res: Result<Probe> = from_slice(&[0xff, 0x00, 0x13]);
        assert!(res.is_err());
    }
}
