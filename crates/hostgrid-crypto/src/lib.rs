//! hostgrid-crypto — at-rest protection for instance secrets.
//!
//! Two-tier envelope encryption: a root key-encryption key (KEK) wraps a
//! per-instance data-encryption key (DEK); the DEK encrypts individual
//! secret fields. Both layers use AES-256-GCM with a fresh random nonce
//! per call.
//!
//! ```text
//! KEK ──wrap_dek──▶ [0x02][nonce:12][ciphertext || tag:16]   (stored)
//! DEK ──SecretCipher──▶ base64([nonce:12][ciphertext || tag:16])  (stored per field)
//! ```

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod kek;
pub mod key;
pub mod secrets;

pub use cipher::SecretCipher;
pub use envelope::{is_wrapped, is_wrapped_base64, unwrap_dek, unwrap_dek_base64, wrap_dek, wrap_dek_base64};
pub use error::{CryptoError, CryptoResult};
pub use kek::load_kek;
pub use key::SecretKey;
pub use secrets::{hash_token, InstanceSecrets};
