//! Symmetric primitives behind the envelope: AEAD sealing, key derivation, signing.
//!
//! Sealed values are `base64(nonce(12) ‖ aead_output)`. All derived keys are 32-byte SHA-256
//! digests, so both supported ciphers take them as-is.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CodecError, ConfigError};

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cipher {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Cipher {
    pub const fn name(self) -> &'static str {
        match self {
            Cipher::Aes256Gcm => "AES-256-GCM",
            Cipher::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Case-insensitive; accepts `_` for `-`.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "AES-256-GCM" | "AES256GCM" => Ok(Cipher::Aes256Gcm),
            "CHACHA20-POLY1305" => Ok(Cipher::ChaCha20Poly1305),
            _ => Err(ConfigError::UnsupportedCipher(name.to_string())),
        }
    }

    pub fn seal(self, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, CodecError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let nonce_ref = Nonce::from_slice(&nonce);
        let sealed = match self {
            Cipher::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CodecError::Encrypt)?
                .encrypt(nonce_ref, plaintext),
            Cipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CodecError::Encrypt)?
                .encrypt(nonce_ref, plaintext),
        }
        .map_err(|_| CodecError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn open(self, key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, CodecError> {
        let raw = STANDARD.decode(encoded.trim()).map_err(|_| CodecError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(CodecError::Decrypt);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);
        match self {
            Cipher::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CodecError::Decrypt)?
                .decrypt(nonce, sealed),
            Cipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CodecError::Decrypt)?
                .decrypt(nonce, sealed),
        }
        .map_err(|_| CodecError::Decrypt)
    }
}

/// Per-call random key. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey([u8; KEY_LEN]);

impl EphemeralKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let raw = STANDARD.decode(encoded.trim()).map_err(|_| CodecError::Decrypt)?;
        let bytes: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::Malformed("ephemeral key must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralKey(<redacted>)")
    }
}

pub fn sha256(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `SHA-256(accessKey ‖ hex(SHA-256(secretKey ‖ K)))`
pub fn inner_key(access_key: &str, secret_key: &str, key: &EphemeralKey) -> [u8; KEY_LEN] {
    let secret_digest = hex::encode(sha256(&[secret_key.as_bytes(), &key.as_bytes()[..]]));
    sha256(&[access_key.as_bytes(), secret_digest.as_bytes()])
}

pub fn service_key(service_key: &str) -> [u8; KEY_LEN] {
    sha256(&[service_key.as_bytes()])
}

pub fn reply_key(key: &EphemeralKey) -> [u8; KEY_LEN] {
    sha256(&[&key.as_bytes()[..], b"reply".as_slice()])
}

/// Short public identifier of the secret key, safe to put on the wire.
pub fn secret_key_id(secret_key: &str) -> String {
    let mut id = hex::encode(sha256(&[secret_key.as_bytes()]));
    id.truncate(16);
    id
}

/// First 32 hex chars of `SHA-256(K ‖ correlationId)`.
pub fn serial(key: &EphemeralKey, correlation_id: &str) -> String {
    let mut serial = hex::encode(sha256(&[&key.as_bytes()[..], correlation_id.as_bytes()]));
    serial.truncate(32);
    serial
}

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `payload` keyed by `secret_key`.
pub fn sign(secret_key: &str, payload: &[u8]) -> Result<String, CodecError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret_key.as_bytes())
        .map_err(|_| CodecError::Signature)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
pub fn verify(secret_key: &str, payload: &[u8], signature: &str) -> Result<(), CodecError> {
    let expected = hex::decode(signature).map_err(|_| CodecError::Signature)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret_key.as_bytes())
        .map_err(|_| CodecError::Signature)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| CodecError::Signature)
}
