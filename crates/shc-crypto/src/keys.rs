//! Symmetric keys: chat keys and password wrapping keys share one type

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

/// A 256-bit AES-GCM key. Zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Raw export as standard base64, the format chat keys travel in.
    pub fn export_raw(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Inverse of [`export_raw`](Self::export_raw). `None` unless the input
    /// decodes to exactly 32 bytes.
    pub fn import_raw(encoded: &str) -> Option<Self> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
        Self::from_slice(&decoded)
    }

    pub(crate) fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = raw.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Export as an `oct` JSON Web Key.
    pub fn to_jwk(&self) -> Zeroizing<String> {
        let jwk = OctJwk {
            kty: "oct".into(),
            k: URL_SAFE_NO_PAD.encode(self.bytes),
            alg: Some("A256GCM".into()),
            ext: Some(true),
            key_ops: Some(vec!["encrypt".into(), "decrypt".into()]),
        };
        // Serializing a struct of strings cannot fail
        Zeroizing::new(serde_json::to_string(&jwk).unwrap_or_default())
    }

    pub fn from_jwk(json: &str) -> Option<Self> {
        let jwk: OctJwk = serde_json::from_str(json).ok()?;
        if jwk.kty != "oct" {
            return None;
        }
        let raw = Zeroizing::new(URL_SAFE_NO_PAD.decode(jwk.k.trim_end_matches('=')).ok()?);
        Self::from_slice(&raw)
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SymmetricKey {}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct OctJwk {
    kty: String,
    k: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ext: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_ops: Option<Vec<String>>,
}

impl Drop for OctJwk {
    fn drop(&mut self) {
        self.k.zeroize();
    }
}

/// Generate a fresh random chat key.
pub fn generate_chat_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricKey::from_bytes(bytes)
}
