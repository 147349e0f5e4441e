//! Password authentication token

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use shc_core::{ShcError, ShcResult};

/// HMAC-SHA256 over the password, keyed by the server-issued key, as
/// lowercase hex. This token is what the server sees and what auto-login
/// persists; the password itself never leaves the client.
pub fn hash_password_for_auth(password: &SecretString, server_key: &str) -> ShcResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(server_key.as_bytes())
        .map_err(|e| ShcError::Crypto(format!("invalid server key for auth hash: {e}")))?;
    mac.update(password.expose_secret().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case_2() {
        let token = hash_password_for_auth(
            &SecretString::from("what do ya want for nothing?"),
            "Jefe",
        )
        .unwrap();
        assert_eq!(
            token,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_deterministic_and_keyed() {
        let pw = SecretString::from("hunter2");
        let a = hash_password_for_auth(&pw, "server-key-1").unwrap();
        assert_eq!(a, hash_password_for_auth(&pw, "server-key-1").unwrap());
        assert_ne!(a, hash_password_for_auth(&pw, "server-key-2").unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_empty_server_key_is_accepted() {
        let token = hash_password_for_auth(&SecretString::from("pw"), "").unwrap();
        assert_eq!(token.len(), 64);
    }
}
