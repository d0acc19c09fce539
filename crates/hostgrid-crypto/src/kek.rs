//! Loading the root key-encryption key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hostgrid_core::config::KekConfig;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::key::SecretKey;

/// Load the KEK named by the config.
///
/// The file or inline value holds the base64 encoding of 32 bytes.
/// Returns `Ok(None)` when neither source is configured.
pub fn load_kek(config: &KekConfig) -> CryptoResult<Option<SecretKey>> {
    let encoded = match (&config.path, &config.value) {
        (Some(_), Some(_)) => {
            return Err(CryptoError::KeyMaterial(
                "both kek.path and kek.value are set".to_string(),
            ));
        }
        (Some(path), None) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| CryptoError::KeyMaterial(format!("{}: {e}", path.display())))?;
            debug!(path = %path.display(), "kek loaded from file");
            Zeroizing::new(content)
        }
        (None, Some(value)) => Zeroizing::new(value.clone()),
        (None, None) => return Ok(None),
    };

    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Base64(e.to_string()))?,
    );
    SecretKey::from_slice(&bytes).map(Some)
}
