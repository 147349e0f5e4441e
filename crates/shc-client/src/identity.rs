//! Identity lifecycle: register, prepare a login, unlock the private key,
//! discard at logout.
//!
//! The private key exists in the clear only in memory, and only after the
//! wrapped copy the server returns at login has been opened with the
//! password-derived wrapping key.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use shc_core::config::CryptoConfig;
use shc_core::{ShcError, ShcResult};
use shc_crypto::{
    derive_wrapping_key, export_public_key, generate_identity_key_pair, hash_password_for_auth,
    import_public_key, unwrap_private_key, wrap_private_key, IdentityKeyPair, KdfParams,
    RsaPrivateKey, RsaPublicKey, SymmetricKey,
};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::credentials::SavedLogin;
use crate::protocol::Login;

/// What the registration endpoint receives. `password` is the auth token.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationBundle {
    pub username: String,
    pub password: String,
    pub public_key: String,
    /// Private key envelope under the wrapping key
    pub private_key: String,
}

impl std::fmt::Debug for RegistrationBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationBundle")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct IdentityState {
    username: Option<String>,
    auth_token: Option<String>,
    wrapping_key: Option<SymmetricKey>,
    keys: Option<IdentityKeyPair>,
}

/// Owns one user's key material for one session.
pub struct IdentityManager {
    kdf: KdfParams,
    rsa_bits: usize,
    state: RwLock<IdentityState>,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("IdentityManager")
            .field("username", &state.username)
            .field("unlocked", &state.keys.is_some())
            .finish()
    }
}

impl Default for IdentityManager {
    fn default() -> Self {
        Self::new(&CryptoConfig::default())
    }
}

impl IdentityManager {
    pub fn new(config: &CryptoConfig) -> Self {
        Self {
            kdf: KdfParams {
                iterations: config.pbkdf2_iterations,
            },
            rsa_bits: config.rsa_bits,
            state: RwLock::new(IdentityState::default()),
        }
    }

    /// Create a new identity. Generates the key pair, wraps the private key
    /// under the password-derived key and returns what the server stores.
    /// The manager is left ready to log in as the new user.
    pub async fn register(
        &self,
        username: &str,
        password: &SecretString,
        server_key: &str,
    ) -> ShcResult<RegistrationBundle> {
        let bits = self.rsa_bits;
        let keys = tokio::task::spawn_blocking(move || generate_identity_key_pair(bits))
            .await
            .map_err(|e| ShcError::Crypto(format!("key generation task failed: {e}")))??;

        let wrapping_key = self.derive(username, password).await?;
        let auth_token = hash_password_for_auth(password, server_key)?;
        let bundle = RegistrationBundle {
            username: username.to_owned(),
            password: auth_token.clone(),
            public_key: export_public_key(&keys.public),
            private_key: wrap_private_key(&keys.private, &wrapping_key)?,
        };

        let mut state = self.write();
        state.username = Some(username.to_owned());
        state.auth_token = Some(auth_token);
        state.wrapping_key = Some(wrapping_key);
        state.keys = None;
        info!(username, "identity registered");
        Ok(bundle)
    }

    /// Derive the wrapping key and auth token for a password login and
    /// return the login packet. The private key stays locked until
    /// [`unlock`](Self::unlock).
    pub async fn prepare_login(
        &self,
        username: &str,
        password: &SecretString,
        server_key: &str,
    ) -> ShcResult<Login> {
        let wrapping_key = self.derive(username, password).await?;
        let auth_token = hash_password_for_auth(password, server_key)?;

        let mut state = self.write();
        state.username = Some(username.to_owned());
        state.auth_token = Some(auth_token.clone());
        state.wrapping_key = Some(wrapping_key);
        state.keys = None;
        debug!(username, "login prepared");
        Ok(Login {
            username: username.to_owned(),
            password: auth_token,
        })
    }

    /// Load a saved login without the password.
    pub fn restore_login(&self, saved: &SavedLogin) -> ShcResult<Login> {
        let wrapping_key = SymmetricKey::from_jwk(&saved.wrapping_key)
            .ok_or_else(|| ShcError::Crypto("saved wrapping key is malformed".into()))?;

        let mut state = self.write();
        state.username = Some(saved.username.clone());
        state.auth_token = Some(saved.auth_token.clone());
        state.wrapping_key = Some(wrapping_key);
        state.keys = None;
        Ok(Login {
            username: saved.username.clone(),
            password: saved.auth_token.clone(),
        })
    }

    /// The login packet for the current credentials, re-sent on every
    /// reconnect.
    pub fn login_request(&self) -> Option<Login> {
        let state = self.read();
        Some(Login {
            username: state.username.clone()?,
            password: state.auth_token.clone()?,
        })
    }

    /// What auto-login needs next time, once the current credentials have
    /// proven themselves by unlocking the private key.
    pub fn saved_login(&self) -> Option<SavedLogin> {
        let state = self.read();
        state.keys.as_ref()?;
        Some(SavedLogin {
            username: state.username.clone()?,
            auth_token: state.auth_token.clone()?,
            wrapping_key: state.wrapping_key.as_ref()?.to_jwk().to_string(),
        })
    }

    /// Open the wrapped private key returned at login. A wrong password
    /// shows up here as a `Crypto` error; nothing is stored in that case.
    pub async fn unlock(&self, wrapped_private_key: &str, public_key: &str) -> ShcResult<()> {
        let wrapping_key = self
            .read()
            .wrapping_key
            .clone()
            .ok_or_else(|| ShcError::Contract("unlock before login was prepared".into()))?;

        let envelope = wrapped_private_key.to_owned();
        let private = tokio::task::spawn_blocking(move || {
            unwrap_private_key(&envelope, &wrapping_key)
        })
        .await
        .map_err(|e| ShcError::Crypto(format!("unwrap task failed: {e}")))?
        .ok_or_else(|| {
            ShcError::Crypto("failed to decrypt private key (wrong password?)".into())
        })?;

        let derived = RsaPublicKey::from(&private);
        let public = match import_public_key(public_key) {
            Some(published) if published == derived => published,
            Some(_) => {
                warn!("published public key does not match the private key, using derived key");
                derived
            }
            None => derived,
        };

        let mut state = self.write();
        state.keys = Some(IdentityKeyPair { private, public });
        info!(username = ?state.username, "identity unlocked");
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.read().keys.is_some()
    }

    pub fn username(&self) -> Option<String> {
        self.read().username.clone()
    }

    pub fn private_key(&self) -> Option<RsaPrivateKey> {
        self.read().keys.as_ref().map(|k| k.private.clone())
    }

    pub fn public_key(&self) -> Option<RsaPublicKey> {
        self.read().keys.as_ref().map(|k| k.public.clone())
    }

    /// Drop every piece of in-memory key material. Stored copies are untouched.
    pub fn discard(&self) {
        *self.write() = IdentityState::default();
        debug!("identity discarded");
    }

    async fn derive(&self, username: &str, password: &SecretString) -> ShcResult<SymmetricKey> {
        let password = SecretString::from(password.expose_secret().to_owned());
        let username = username.to_owned();
        let params = self.kdf.clone();
        tokio::task::spawn_blocking(move || derive_wrapping_key(&password, &username, &params))
            .await
            .map_err(|e| ShcError::Crypto(format!("key derivation task failed: {e}")))
    }

    fn read(&self) -> RwLockReadGuard<'_, IdentityState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IdentityState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_manager() -> IdentityManager {
        IdentityManager::new(&CryptoConfig {
            pbkdf2_iterations: 1000,
            rsa_bits: 1024,
        })
    }

    #[tokio::test]
    async fn test_register_then_unlock() {
        let manager = fast_manager();
        let password = SecretString::from("correct horse battery");
        let bundle = manager
            .register("alice", &password, "server-key")
            .await
            .unwrap();
        assert_eq!(bundle.username, "alice");
        assert_eq!(bundle.password.len(), 64);
        assert!(!manager.is_unlocked());
        assert!(manager.saved_login().is_none());

        manager
            .unlock(&bundle.private_key, &bundle.public_key)
            .await
            .unwrap();
        assert!(manager.is_unlocked());
        assert_eq!(
            manager.public_key().unwrap(),
            import_public_key(&bundle.public_key).unwrap()
        );
        let saved = manager.saved_login().unwrap();
        assert_eq!(saved.auth_token, bundle.password);
    }

    #[tokio::test]
    async fn test_wrong_password_is_crypto_error() {
        let manager = fast_manager();
        let bundle = manager
            .register("alice", &SecretString::from("right"), "k")
            .await
            .unwrap();

        manager
            .prepare_login("alice", &SecretString::from("wrong"), "k")
            .await
            .unwrap();
        let err = manager
            .unlock(&bundle.private_key, &bundle.public_key)
            .await
            .unwrap_err();
        assert!(matches!(err, ShcError::Crypto(_)));
        assert!(!manager.is_unlocked());
    }

    #[tokio::test]
    async fn test_restore_login_unlocks_without_password() {
        let first = fast_manager();
        let bundle = first
            .register("alice", &SecretString::from("pw"), "k")
            .await
            .unwrap();
        first
            .unlock(&bundle.private_key, &bundle.public_key)
            .await
            .unwrap();
        let saved = first.saved_login().unwrap();

        let second = fast_manager();
        let login = second.restore_login(&saved).unwrap();
        assert_eq!(login.password, bundle.password);
        second
            .unlock(&bundle.private_key, &bundle.public_key)
            .await
            .unwrap();
        assert_eq!(second.private_key(), first.private_key());
    }

    #[tokio::test]
    async fn test_unlock_requires_prepared_login() {
        let manager = fast_manager();
        assert!(matches!(
            manager.unlock("aXY=.Y3Q=", "{}").await,
            Err(ShcError::Contract(_))
        ));
        assert!(manager.login_request().is_none());
    }

    #[tokio::test]
    async fn test_discard_forgets_everything() {
        let manager = fast_manager();
        manager
            .prepare_login("alice", &SecretString::from("pw"), "k")
            .await
            .unwrap();
        assert!(manager.login_request().is_some());
        manager.discard();
        assert!(manager.login_request().is_none());
        assert!(manager.username().is_none());
    }
}
