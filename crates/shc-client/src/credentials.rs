//! Saved login for auto-login
//!
//! Holds the username, the HMAC auth token and the wrapping key as an `oct`
//! JWK. The password itself is never written anywhere.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SavedLogin {
    pub username: String,
    pub auth_token: String,
    /// `oct` JWK of the password-derived wrapping key
    pub wrapping_key: String,
}

impl std::fmt::Debug for SavedLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedLogin")
            .field("username", &self.username)
            .field("auth_token", &"[REDACTED]")
            .field("wrapping_key", &"[REDACTED]")
            .finish()
    }
}

impl SavedLogin {
    /// `Ok(None)` when no login has been saved.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading saved login: {}", path.display()))?;
        let saved = serde_json::from_str(&content)
            .with_context(|| format!("parsing saved login: {}", path.display()))?;
        Ok(Some(saved))
    }

    /// Write atomically, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serializing saved login")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing saved login: {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting permissions: {}", tmp.display()))?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming saved login: {}", path.display()))
    }

    /// Forget the saved login. Missing files are not an error.
    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing saved login: {}", path.display())),
        }
    }
}
