//! The exchange message envelope
//!
//! Every protocol message on the exchange is signed end-to-end and
//! encrypted for exactly one receiver:
//!
//! 1. SHA3-256 the inner payload and sign the digest with the
//!    sender's Ed25519 key.
//! 2. Bundle `{payload, signature, sender_pubkey}` as the wrapped
//!    message.
//! 3. Generate a fresh AES-256-GCM key and nonce; encrypt the wrapped
//!    message.
//! 4. JSON-encode `{key, nonce}` and seal it to the receiver's X25519
//!    public key (ephemeral ECDH, HKDF-SHA256, AES-GCM).
//! 5. Transmit `{encrypted_wrapped, encrypted_sym}`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

use crate::hash::sha3_256;
use crate::keys::{decode_key32, EncryptionKey, KeyPair, PublicKey};
use crate::signature::{sign_digest, verify_digest};
use crate::{CryptoError, CryptoResult};

const NONCE_LEN: usize = 12;
const SYM_KEY_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"edgepact-envelope-v1";

/// Signed inner message: payload plus the sender's attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub payload: serde_json::Value,
    /// Ed25519 signature over the SHA3-256 digest of the payload, hex
    pub signature: String,
    /// Sender's Ed25519 public key, hex
    pub sender_pubkey: String,
}

/// The fresh symmetric material protecting one wrapped message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SymmetricValues {
    key: String,
    nonce: String,
}

/// `{key, nonce}` sealed to the receiver's X25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSymmetricValues {
    /// Sender's ephemeral X25519 public key, hex
    pub ephemeral_pubkey: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// The on-wire form of an exchange message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEnvelope {
    /// AES-GCM ciphertext of the wrapped message, hex
    pub encrypted_wrapped: String,
    pub encrypted_sym: SealedSymmetricValues,
}

/// Sign `payload` with `sender` and encrypt it for the holder of
/// `receiver_pub_hex`.
pub fn seal(
    payload: &serde_json::Value,
    sender: &KeyPair,
    receiver_pub_hex: &str,
) -> CryptoResult<ExchangeEnvelope> {
    // Steps 1-2: sign the payload digest, bundle the wrapped message.
    let payload_bytes = serde_json::to_vec(payload)?;
    let digest = sha3_256(&payload_bytes);
    let wrapped = WrappedMessage {
        payload: payload.clone(),
        signature: sign_digest(sender, &digest)?,
        sender_pubkey: sender.public_key_hex(),
    };
    let wrapped_bytes = serde_json::to_vec(&wrapped)?;

    // Step 3: fresh symmetric key and nonce for the wrapped message.
    let mut sym_key = [0u8; SYM_KEY_LEN];
    let mut sym_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut sym_key);
    OsRng.fill_bytes(&mut sym_nonce);

    let cipher = Aes256Gcm::new_from_slice(&sym_key)
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;
    let encrypted_wrapped = cipher
        .encrypt(Nonce::from_slice(&sym_nonce), wrapped_bytes.as_slice())
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

    // Step 4: seal the symmetric values to the receiver.
    let sym_values = SymmetricValues {
        key: hex::encode(sym_key),
        nonce: hex::encode(sym_nonce),
    };
    let sym_bytes = serde_json::to_vec(&sym_values)?;
    let encrypted_sym = seal_to_public(&sym_bytes, receiver_pub_hex)?;

    Ok(ExchangeEnvelope {
        encrypted_wrapped: hex::encode(encrypted_wrapped),
        encrypted_sym,
    })
}

/// Decrypt an envelope with the receiver's X25519 key and verify the
/// sender's signature over the payload.
pub fn open(envelope: &ExchangeEnvelope, receiver: &EncryptionKey) -> CryptoResult<WrappedMessage> {
    let sym_bytes = open_sealed(&envelope.encrypted_sym, receiver)?;
    let sym_values: SymmetricValues = serde_json::from_slice(&sym_bytes)?;

    let key = decode_key32(&sym_values.key)?;
    let nonce = decode_nonce(&sym_values.nonce)?;
    let ciphertext = hex::decode(&envelope.encrypted_wrapped)
        .map_err(|e| CryptoError::OpenFailed(e.to_string()))?;

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::OpenFailed(e.to_string()))?;
    let wrapped_bytes = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|e| CryptoError::OpenFailed(e.to_string()))?;
    let wrapped: WrappedMessage = serde_json::from_slice(&wrapped_bytes)?;

    let payload_bytes = serde_json::to_vec(&wrapped.payload)?;
    let digest = sha3_256(&payload_bytes);
    let sender = PublicKey(wrapped.sender_pubkey.clone());
    if !verify_digest(&sender, &digest, &wrapped.signature)? {
        return Err(CryptoError::VerificationFailed(
            "wrapped message signature does not match payload".to_string(),
        ));
    }
    Ok(wrapped)
}

/// Seal bytes to an X25519 public key with an ephemeral ECDH.
fn seal_to_public(plaintext: &[u8], receiver_pub_hex: &str) -> CryptoResult<SealedSymmetricValues> {
    let receiver_pub = X25519Public::from(decode_key32(receiver_pub_hex)?);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&receiver_pub);

    let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes())?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::SealFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

    Ok(SealedSymmetricValues {
        ephemeral_pubkey: hex::encode(ephemeral_pub.as_bytes()),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

fn open_sealed(sealed: &SealedSymmetricValues, receiver: &EncryptionKey) -> CryptoResult<Vec<u8>> {
    let ephemeral_pub = X25519Public::from(decode_key32(&sealed.ephemeral_pubkey)?);
    let shared = receiver.secret().diffie_hellman(&ephemeral_pub);

    let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes())?;
    let nonce = decode_nonce(&sealed.nonce)?;
    let ciphertext =
        hex::decode(&sealed.ciphertext).map_err(|e| CryptoError::OpenFailed(e.to_string()))?;

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::OpenFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|e| CryptoError::OpenFailed(e.to_string()))
}

fn derive_seal_key(shared: &[u8], ephemeral_pub: &[u8]) -> CryptoResult<[u8; SYM_KEY_LEN]> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared);
    let mut out = [0u8; SYM_KEY_LEN];
    hkdf.expand(ephemeral_pub, &mut out)
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;
    Ok(out)
}

fn decode_nonce(hex_nonce: &str) -> CryptoResult<[u8; NONCE_LEN]> {
    let bytes =
        hex::decode(hex_nonce).map_err(|e| CryptoError::OpenFailed(e.to_string()))?;
    if bytes.len() != NONCE_LEN {
        return Err(CryptoError::OpenFailed(format!(
            "expected {} nonce bytes, got {}",
            NONCE_LEN,
            bytes.len()
        )));
    }
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let sender = KeyPair::generate();
        let receiver = EncryptionKey::generate();
        let payload = serde_json::json!({"kind": "proposal", "agreementId": "aa".repeat(32)});

        let envelope = seal(&payload, &sender, &receiver.public_key_hex()).unwrap();
        let wrapped = open(&envelope, &receiver).unwrap();

        assert_eq!(wrapped.payload, payload);
        assert_eq!(wrapped.sender_pubkey, sender.public_key_hex());
    }

    #[test]
    fn wrong_receiver_cannot_open() {
        let sender = KeyPair::generate();
        let receiver = EncryptionKey::generate();
        let eavesdropper = EncryptionKey::generate();
        let payload = serde_json::json!({"kind": "reply"});

        let envelope = seal(&payload, &sender, &receiver.public_key_hex()).unwrap();
        assert!(open(&envelope, &eavesdropper).is_err());
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let sender = KeyPair::generate();
        let receiver = EncryptionKey::generate();
        let payload = serde_json::json!({"decision": true});

        let envelope = seal(&payload, &sender, &receiver.public_key_hex()).unwrap();

        // Re-encrypt a different payload under the same symmetric
        // values but keep the original signature.
        let sym = open_sealed(&envelope.encrypted_sym, &receiver).unwrap();
        let sym_values: SymmetricValues = serde_json::from_slice(&sym).unwrap();
        let key = decode_key32(&sym_values.key).unwrap();
        let nonce = decode_nonce(&sym_values.nonce).unwrap();

        let original = {
            let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
            let bytes = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    hex::decode(&envelope.encrypted_wrapped).unwrap().as_slice(),
                )
                .unwrap();
            serde_json::from_slice::<WrappedMessage>(&bytes).unwrap()
        };
        let forged = WrappedMessage {
            payload: serde_json::json!({"decision": false}),
            ..original
        };
        let forged_bytes = serde_json::to_vec(&forged).unwrap();
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        let forged_ct = cipher
            .encrypt(Nonce::from_slice(&nonce), forged_bytes.as_slice())
            .unwrap();

        let tampered = ExchangeEnvelope {
            encrypted_wrapped: hex::encode(forged_ct),
            encrypted_sym: envelope.encrypted_sym.clone(),
        };
        assert!(matches!(
            open(&tampered, &receiver),
            Err(CryptoError::VerificationFailed(_))
        ));
    }

    #[test]
    fn envelope_serializes_for_transport() {
        let sender = KeyPair::generate();
        let receiver = EncryptionKey::generate();
        let payload = serde_json::json!({"kind": "update"});

        let envelope = seal(&payload, &sender, &receiver.public_key_hex()).unwrap();
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(wire.contains("encrypted_wrapped"));
        assert!(wire.contains("encrypted_sym"));

        let back: ExchangeEnvelope = serde_json::from_str(&wire).unwrap();
        let wrapped = open(&back, &receiver).unwrap();
        assert_eq!(wrapped.payload, payload);
    }
}
