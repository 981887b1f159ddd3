//! Key management
//!
//! Two key families exist per identity: an Ed25519 pair for signing
//! proposal digests and an X25519 pair for receiving sealed message
//! envelopes. Public halves travel as lowercase hex.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{CryptoError, CryptoResult};

/// Ed25519 signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Rebuild from stored signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Signing key bytes, for secure storage only.
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// A verifying key reference, safe to share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub String);

impl PublicKey {
    pub fn from_keypair(keypair: &KeyPair) -> Self {
        Self(keypair.public_key_hex())
    }

    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        let bytes = decode_key32(&self.0)?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
    }
}

/// X25519 pair used for receiving sealed envelopes.
#[derive(Clone)]
pub struct EncryptionKey {
    secret: StaticSecret,
    public: X25519Public,
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public(&self) -> &X25519Public {
        &self.public
    }

    /// Public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

/// Decode a 32-byte hex-encoded key.
pub(crate) fn decode_key32(hex_key: &str) -> CryptoResult<[u8; 32]> {
    let bytes =
        hex::decode(hex_key).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyFormat(format!(
            "expected 32 key bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_bytes() {
        let a = KeyPair::generate();
        let b = KeyPair::from_bytes(&a.signing_key_bytes());
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn public_key_hex_parses_back() {
        let keypair = KeyPair::generate();
        let public = PublicKey::from_keypair(&keypair);
        assert_eq!(&public.to_verifying_key().unwrap(), keypair.verifying_key());
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(PublicKey("zz".to_string()).to_verifying_key().is_err());
        assert!(PublicKey("ab".repeat(16)[..30].to_string()).to_verifying_key().is_err());
    }

    #[test]
    fn encryption_key_is_stable() {
        let key = EncryptionKey::generate();
        let again = EncryptionKey::from_bytes(key.secret().to_bytes());
        assert_eq!(key.public_key_hex(), again.public_key_hex());
    }
}
