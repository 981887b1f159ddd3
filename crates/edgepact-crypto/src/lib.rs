//! Edgepact Crypto - primitives for agreement negotiation
//!
//! This crate provides:
//! - SHA3-256 content hashing over canonical JSON
//! - Ed25519 key pairs and proposal signatures
//! - The end-to-end exchange message envelope (sign, then AES-GCM
//!   encrypt under a fresh key sealed to the receiver via X25519)
//!
//! # Security Invariant
//!
//! Private key material never appears in wire structures or logs.

pub mod envelope;
pub mod hash;
pub mod keys;
pub mod signature;

pub use envelope::*;
pub use hash::*;
pub use keys::*;
pub use signature::*;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid key material: {0}")]
    InvalidKeyFormat(String),

    #[error("envelope encryption failed: {0}")]
    SealFailed(String),

    #[error("envelope decryption failed: {0}")]
    OpenFailed(String),

    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
