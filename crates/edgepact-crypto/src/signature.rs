//! Proposal signatures
//!
//! A proposal is signed by hashing its canonical JSON with SHA3-256
//! and producing an Ed25519 signature over the 32-byte digest.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};

use crate::hash::content_digest;
use crate::keys::{KeyPair, PublicKey};
use crate::{CryptoError, CryptoResult};

/// Sign a 32-byte digest. Returns the signature as lowercase hex.
pub fn sign_digest(keypair: &KeyPair, digest: &[u8; 32]) -> CryptoResult<String> {
    let signature = keypair
        .signing_key()
        .try_sign(digest)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(hex::encode(signature.to_bytes()))
}

/// Verify a hex signature over a 32-byte digest.
pub fn verify_digest(public: &PublicKey, digest: &[u8; 32], sig_hex: &str) -> CryptoResult<bool> {
    let sig_bytes =
        hex::decode(sig_hex).map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;
    if sig_bytes.len() != 64 {
        return Err(CryptoError::VerificationFailed(
            "signature must be 64 bytes".to_string(),
        ));
    }
    let mut arr = [0u8; 64];
    arr.copy_from_slice(&sig_bytes);
    let signature = Ed25519Signature::from_bytes(&arr);
    let verifying = public.to_verifying_key()?;
    Ok(verifying.verify(digest, &signature).is_ok())
}

/// Hash and sign a serializable proposal document.
///
/// Returns `(digest_hex, signature_hex)`, the pair recorded on the
/// agreement and on the ledger.
pub fn sign_content<T: serde::Serialize>(
    keypair: &KeyPair,
    value: &T,
) -> CryptoResult<(String, String)> {
    let digest = content_digest(value)?;
    let sig = sign_digest(keypair, &digest)?;
    Ok((hex::encode(digest), sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha3_256;

    #[test]
    fn sign_and_verify_digest() {
        let keypair = KeyPair::generate();
        let digest = sha3_256(b"proposal body");
        let sig = sign_digest(&keypair, &digest).unwrap();
        let public = PublicKey::from_keypair(&keypair);
        assert!(verify_digest(&public, &digest, &sig).unwrap());
    }

    #[test]
    fn wrong_digest_fails_verification() {
        let keypair = KeyPair::generate();
        let sig = sign_digest(&keypair, &sha3_256(b"one")).unwrap();
        let public = PublicKey::from_keypair(&keypair);
        assert!(!verify_digest(&public, &sha3_256(b"two"), &sig).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let digest = sha3_256(b"body");
        let sig = sign_digest(&KeyPair::generate(), &digest).unwrap();
        let other = PublicKey::from_keypair(&KeyPair::generate());
        assert!(!verify_digest(&other, &digest, &sig).unwrap());
    }

    #[test]
    fn sign_content_yields_hash_and_signature() {
        let keypair = KeyPair::generate();
        let value = serde_json::json!({"agreementId": "aa", "version": 2});
        let (hash, sig) = sign_content(&keypair, &value).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(sig.len(), 128);
    }
}
