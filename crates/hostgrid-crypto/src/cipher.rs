//! Per-field secret encryption under an instance DEK.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::envelope::{NONCE_LEN, TAG_LEN};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{SecretKey, KEY_LEN};

/// Encrypts and decrypts individual secret fields with one DEK.
///
/// Ciphertexts are `base64([nonce: 12][ciphertext || tag: 16])`.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(dek: &SecretKey) -> CryptoResult<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|_| CryptoError::KeyLength(KEY_LEN))?;
        Ok(Self { cipher })
    }

    pub fn encrypt_field(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt_field(&self, encoded: &str) -> CryptoResult<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Base64(e.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort(raw.len()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }
}
