//! Cryptographic error type. Every variant is fatal to the operation
//! that raised it.

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("unexpected version byte: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedVersion { expected: u8, found: u8 },

    #[error("wrapped data too short: {0} bytes")]
    TooShort(usize),

    #[error("decryption failed: wrong key or tampered data")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("failed to read key material: {0}")]
    KeyMaterial(String),

    #[error("decrypted secret is not valid UTF-8")]
    Utf8,
}
