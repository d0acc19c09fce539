//! Per-instance secret generation.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const PASSWORD_LEN: usize = 32;
const ACCESS_KEY_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;
const TOKEN_BYTES: usize = 32;

/// Freshly generated credentials for one instance.
///
/// Plaintext lives only in memory and is wiped on drop; what gets stored
/// is the encrypted form (or, for the bootstrap token, its hash).
pub struct InstanceSecrets {
    pub database_password: Zeroizing<String>,
    /// Storage access key id; not secret on its own.
    pub storage_access_key: String,
    pub storage_secret_key: Zeroizing<String>,
    pub bootstrap_token: Zeroizing<String>,
}

impl InstanceSecrets {
    pub fn generate() -> Self {
        let token: [u8; TOKEN_BYTES] = rand::random();
        Self {
            database_password: Zeroizing::new(random_alphanumeric(PASSWORD_LEN)),
            storage_access_key: format!("HG{}", random_alphanumeric(ACCESS_KEY_LEN - 2))
                .to_ascii_uppercase(),
            storage_secret_key: Zeroizing::new(random_alphanumeric(SECRET_KEY_LEN)),
            bootstrap_token: Zeroizing::new(hex::encode(token)),
        }
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Hex SHA-256 of a bootstrap token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
