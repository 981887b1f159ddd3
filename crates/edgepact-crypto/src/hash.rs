//! Content hashing
//!
//! All change detection and proposal digests use SHA3-256 over the
//! canonical JSON form of a value. Canonical means the serde
//! serialization with struct fields in declaration order, which is
//! deterministic for the document types we hash.

use sha3::{Digest, Sha3_256};

use crate::CryptoResult;

/// SHA3-256 of raw bytes.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256 of raw bytes as lowercase hex.
pub fn sha3_256_hex(data: &[u8]) -> String {
    hex::encode(sha3_256(data))
}

/// Fingerprint of a serializable value: SHA3-256 over its canonical
/// JSON form.
pub fn content_digest<T: serde::Serialize>(value: &T) -> CryptoResult<[u8; 32]> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha3_256(&bytes))
}

/// [`content_digest`] as lowercase hex.
pub fn content_digest_hex<T: serde::Serialize>(value: &T) -> CryptoResult<String> {
    Ok(hex::encode(content_digest(value)?))
}
