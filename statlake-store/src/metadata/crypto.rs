//! Field sealing and credential hashing.
//!
//! Sealed values use ChaCha20-Poly1305 with a key derived from the master key
//! via BLAKE3 `derive_key`. The record coordinates (`user_id`, key) are bound
//! as associated data, so a sealed value copied to another row fails to open.
//!
//! Envelope: `enc:v1:<nonce b64>:<ciphertext b64>`.

use crate::error::{Result, StoreError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

const SEAL_CONTEXT: &str = "statlake 2024-05 metadata field sealing v1";
const CREDENTIAL_CONTEXT: &str = "statlake 2024-05 api credential hashing v1";
const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// Holds derived keys; never the master key itself.
pub struct FieldCipher {
    seal_key: Option<[u8; 32]>,
    credential_key: [u8; 32],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("sealing", &self.seal_key.is_some())
            .finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Without a master key, sealing is unavailable and credential hashes use
    /// a context-only key.
    pub fn new(master_key: Option<&str>) -> Self {
        let master = master_key.map(str::as_bytes).filter(|k| !k.is_empty());
        Self {
            seal_key: master.map(|m| blake3::derive_key(SEAL_CONTEXT, m)),
            credential_key: blake3::derive_key(CREDENTIAL_CONTEXT, master.unwrap_or_default()),
        }
    }

    pub fn can_seal(&self) -> bool {
        self.seal_key.is_some()
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        let key = self.seal_key.as_ref().ok_or_else(|| {
            StoreError::Crypto("no master key configured; cannot seal or open fields".into())
        })?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
    }

    pub fn seal(&self, plaintext: &str, aad: &[u8]) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad,
                },
            )
            .map_err(|_| StoreError::Crypto("encryption failed".into()))?;
        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}",
            STANDARD.encode(nonce),
            STANDARD.encode(ciphertext)
        ))
    }

    pub fn open(&self, envelope: &str, aad: &[u8]) -> Result<String> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| StoreError::Crypto("not a sealed value".into()))?;
        let (nonce_b64, ct_b64) = body
            .split_once(':')
            .ok_or_else(|| StoreError::Crypto("malformed envelope".into()))?;
        let nonce = STANDARD
            .decode(nonce_b64)
            .map_err(|e| StoreError::Crypto(format!("bad nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Crypto(format!("nonce must be {NONCE_LEN} bytes")));
        }
        let ciphertext = STANDARD
            .decode(ct_b64)
            .map_err(|e| StoreError::Crypto(format!("bad ciphertext encoding: {e}")))?;

        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| StoreError::Crypto("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| StoreError::Crypto(format!("plaintext is not utf-8: {e}")))
    }

    /// Keyed hash of a credential secret, hex encoded.
    pub fn hash_secret(&self, service_name: &str, secret: &str) -> String {
        self.secret_digest(service_name, secret).to_hex().to_string()
    }

    /// Constant-time comparison against a stored hex digest.
    pub fn verify_secret(&self, service_name: &str, secret: &str, stored_hex: &str) -> bool {
        match blake3::Hash::from_hex(stored_hex) {
            Ok(stored) => stored == self.secret_digest(service_name, secret),
            Err(_) => false,
        }
    }

    fn secret_digest(&self, service_name: &str, secret: &str) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.credential_key);
        hasher.update(service_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(secret.as_bytes());
        hasher.finalize()
    }
}

pub(crate) fn is_envelope(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Associated data for a preference field.
pub(crate) fn preference_aad(user_id: &str, key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(user_id.len() + key.len() + 1);
    aad.extend_from_slice(user_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key.as_bytes());
    aad
}
