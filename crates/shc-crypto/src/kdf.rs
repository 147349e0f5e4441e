//! Key derivation: PBKDF2-HMAC-SHA256 password → wrapping key

use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::keys::SymmetricKey;
use crate::{KEY_SIZE, PBKDF2_ITERATIONS};

/// PBKDF2 parameters for the wrapping key
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Rounds (default: 100 000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

/// Derive the 256-bit wrapping key from a password, salted with the username.
///
/// Deterministic: the same (password, username) pair always yields the same
/// key, so the key itself never has to be stored.
pub fn derive_wrapping_key(
    password: &SecretString,
    username: &str,
    params: &KdfParams,
) -> SymmetricKey {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        username.as_bytes(),
        params.iterations,
        &mut key,
    );
    SymmetricKey::from_bytes(key)
}
