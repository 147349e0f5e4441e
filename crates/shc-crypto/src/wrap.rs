//! Key wrapping: private key under the password wrapping key, chat keys
//! under a recipient's public key

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use shc_core::{ShcError, ShcResult};
use zeroize::Zeroizing;

use crate::aead::{open, seal};
use crate::envelope::Envelope;
use crate::identity::{export_private_key, import_private_key};
use crate::keys::SymmetricKey;

/// Encrypt the private key's JWK under the wrapping key.
pub fn wrap_private_key(private: &RsaPrivateKey, wrapping_key: &SymmetricKey) -> ShcResult<String> {
    let jwk = export_private_key(private)?;
    Ok(seal(wrapping_key, jwk.as_bytes())?.encode())
}

/// Reverse of [`wrap_private_key`]. Accepts both envelope forms.
///
/// `None` on a wrong password, a corrupt envelope or malformed JWK.
pub fn unwrap_private_key(envelope: &str, wrapping_key: &SymmetricKey) -> Option<RsaPrivateKey> {
    let Some(parsed) = Envelope::parse(envelope) else {
        tracing::warn!("wrapped private key is not a recognised envelope");
        return None;
    };
    let Some(plaintext) = open(wrapping_key, &parsed).map(Zeroizing::new) else {
        tracing::debug!(format = ?parsed.format, "private key unwrap failed authentication");
        return None;
    };
    let json = std::str::from_utf8(&plaintext).ok()?;
    let key = import_private_key(json);
    if key.is_none() {
        tracing::warn!("unwrapped private key is not a valid RSA JWK");
    }
    key
}

/// RSA-OAEP-SHA256 encrypt the raw chat key for one recipient; base64 output.
pub fn wrap_key_for_recipient(key: &SymmetricKey, recipient: &RsaPublicKey) -> ShcResult<String> {
    let wrapped = recipient
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| ShcError::Crypto(format!("RSA-OAEP wrap failed: {e}")))?;
    Ok(STANDARD.encode(wrapped))
}

/// Reverse of [`wrap_key_for_recipient`]. `None` if the envelope was not
/// addressed to `private` or is corrupt.
pub fn unwrap_key(envelope: &str, private: &RsaPrivateKey) -> Option<SymmetricKey> {
    let wrapped = STANDARD.decode(envelope.trim()).ok()?;
    let raw = Zeroizing::new(private.decrypt(Oaep::new::<Sha256>(), &wrapped).ok()?);
    SymmetricKey::from_slice(&raw)
}
