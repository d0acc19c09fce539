//! DEK wrapping under the KEK.
//!
//! Wrapped layout: `[version = 0x02][nonce: 12][ciphertext || tag: 16]`.
//! The version byte is also bound as associated data, so it cannot be
//! swapped without failing authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::key::{SecretKey, KEY_LEN};

pub const WRAP_VERSION: u8 = 0x02;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Smallest blob that can possibly decrypt: header, nonce, tag.
pub const MIN_WRAPPED_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// Exact length of a wrapped 32-byte DEK.
pub const WRAPPED_DEK_LEN: usize = MIN_WRAPPED_LEN + KEY_LEN;

fn kek_cipher(kek: &SecretKey) -> CryptoResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(kek.as_bytes()).map_err(|_| CryptoError::KeyLength(KEY_LEN))
}

/// Wrap `dek` under `kek`.
///
/// A fresh nonce is drawn on every call, so wrapping the same DEK twice
/// produces different blobs.
pub fn wrap_dek(dek: &SecretKey, kek: &SecretKey) -> CryptoResult<Vec<u8>> {
    let cipher = kek_cipher(kek)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: dek.as_bytes(),
                aad: &[WRAP_VERSION],
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    blob.push(WRAP_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Recover the DEK from a wrapped blob.
///
/// Fails on a wrong version byte, a truncated blob, a wrong KEK, or any
/// modification of the blob. Never returns unauthenticated plaintext.
pub fn unwrap_dek(blob: &[u8], kek: &SecretKey) -> CryptoResult<SecretKey> {
    let Some(&version) = blob.first() else {
        return Err(CryptoError::TooShort(0));
    };
    if version != WRAP_VERSION {
        return Err(CryptoError::UnexpectedVersion {
            expected: WRAP_VERSION,
            found: version,
        });
    }
    if blob.len() < MIN_WRAPPED_LEN {
        return Err(CryptoError::TooShort(blob.len()));
    }

    let (nonce, ciphertext) = blob[1..].split_at(NONCE_LEN);
    let plaintext = zeroize::Zeroizing::new(
        kek_cipher(kek)?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[WRAP_VERSION],
                },
            )
            .map_err(|_| CryptoError::Decrypt)?,
    );
    SecretKey::from_slice(&plaintext).map_err(|_| CryptoError::Decrypt)
}

/// Structural check: does `blob` look like a wrapped DEK?
///
/// Used during key-rotation migrations to tell wrapped keys from legacy
/// plaintext ones. Never fails.
pub fn is_wrapped(blob: &[u8]) -> bool {
    blob.len() == WRAPPED_DEK_LEN && blob[0] == WRAP_VERSION
}

/// [`is_wrapped`] over a base64 string; malformed input is simply `false`.
pub fn is_wrapped_base64(encoded: &str) -> bool {
    STANDARD
        .decode(encoded.trim())
        .map(|blob| is_wrapped(&blob))
        .unwrap_or(false)
}

/// [`wrap_dek`], base64-encoded for storage in text columns.
pub fn wrap_dek_base64(dek: &SecretKey, kek: &SecretKey) -> CryptoResult<String> {
    Ok(STANDARD.encode(wrap_dek(dek, kek)?))
}

/// [`unwrap_dek`] from a base64 string.
pub fn unwrap_dek_base64(encoded: &str, kek: &SecretKey) -> CryptoResult<SecretKey> {
    let blob = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::Base64(e.to_string()))?;
    unwrap_dek(&blob, kek)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_random_keys() {
        for _ in 0..64 {
            let dek = SecretKey::generate();
            let kek = SecretKey::generate();
            let wrapped = wrap_dek(&dek, &kek).unwrap();
            assert_eq!(wrapped.len(), WRAPPED_DEK_LEN);
            assert_eq!(unwrap_dek(&wrapped, &kek).unwrap().as_bytes(), dek.as_bytes());
        }
    }

    #[test]
    fn wrapping_is_non_deterministic() {
        let dek = SecretKey::generate();
        let kek = SecretKey::generate();
        let a = wrap_dek(&dek, &kek).unwrap();
        let b = wrap_dek(&dek, &kek).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            unwrap_dek(&a, &kek).unwrap().as_bytes(),
            unwrap_dek(&b, &kek).unwrap().as_bytes()
        );
    }

    #[test]
    fn wrong_kek_fails() {
        let dek = SecretKey::generate();
        let wrapped = wrap_dek(&dek, &SecretKey::generate()).unwrap();
        assert_eq!(
            unwrap_dek(&wrapped, &SecretKey::generate()).unwrap_err(),
            CryptoError::Decrypt
        );
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let dek = SecretKey::generate();
        let kek = SecretKey::generate();
        let wrapped = wrap_dek(&dek, &kek).unwrap();

        for byte in 0..wrapped.len() {
            for bit in 0..8 {
                let mut tampered = wrapped.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    unwrap_dek(&tampered, &kek).is_err(),
                    "flip of byte {byte} bit {bit} was accepted"
                );
            }
        }
    }

    #[test]
    fn version_byte_checked_first() {
        let kek = SecretKey::generate();
        let mut wrapped = wrap_dek(&SecretKey::generate(), &kek).unwrap();
        wrapped[0] = 0x01;
        assert_eq!(
            unwrap_dek(&wrapped, &kek).unwrap_err(),
            CryptoError::UnexpectedVersion {
                expected: 0x02,
                found: 0x01
            }
        );
        assert!(unwrap_dek(&wrapped, &kek)
            .unwrap_err()
            .to_string()
            .contains("unexpected version byte"));
    }

    #[test]
    fn truncated_blob_is_too_short() {
        let kek = SecretKey::generate();
        assert_eq!(unwrap_dek(&[], &kek).unwrap_err(), CryptoError::TooShort(0));
        let err = unwrap_dek(&[WRAP_VERSION; 10], &kek).unwrap_err();
        assert_eq!(err, CryptoError::TooShort(10));
        assert!(err.to_string().contains("wrapped data too short"));
    }

    #[test]
    fn structural_checks() {
        let kek = SecretKey::generate();
        let dek = SecretKey::generate();
        let wrapped = wrap_dek(&dek, &kek).unwrap();

        assert!(is_wrapped(&wrapped));
        assert!(!is_wrapped(dek.as_bytes()));
        assert!(!is_wrapped(&[]));
        assert!(!is_wrapped(&wrapped[..20]));

        let encoded = wrap_dek_base64(&dek, &kek).unwrap();
        assert!(is_wrapped_base64(&encoded));
        assert!(!is_wrapped_base64(""));
        assert!(!is_wrapped_base64("not base64 at all!"));
        assert!(!is_wrapped_base64(&STANDARD.encode(dek.as_bytes())));
        assert_eq!(unwrap_dek_base64(&encoded, &kek).unwrap().as_bytes(), dek.as_bytes());
    }

    #[test]
    fn bad_base64_is_an_error() {
        let kek = SecretKey::generate();
        assert!(matches!(
            unwrap_dek_base64("%%%", &kek),
            Err(CryptoError::Base64(_))
        ));
    }
}
