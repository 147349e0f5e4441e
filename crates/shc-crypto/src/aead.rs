//! AES-256-GCM sealing of payloads into envelopes

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use shc_core::{ShcError, ShcResult};

use crate::envelope::Envelope;
use crate::keys::SymmetricKey;
use crate::IV_SIZE;

fn cipher(key: &SymmetricKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

/// Encrypt under a fresh random IV.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> ShcResult<Envelope> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher(key)
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| ShcError::Crypto(format!("AES-GCM encryption failed: {e}")))?;

    Ok(Envelope::new(iv, ciphertext))
}

/// Decrypt and authenticate. `None` on a wrong key or tampered data.
pub fn open(key: &SymmetricKey, envelope: &Envelope) -> Option<Vec<u8>> {
    cipher(key)
        .decrypt(Nonce::from_slice(&envelope.iv), envelope.ciphertext.as_slice())
        .ok()
}

/// Encrypt bytes into an encoded envelope string.
pub fn encrypt_payload(plaintext: &[u8], key: &SymmetricKey) -> ShcResult<String> {
    Ok(seal(key, plaintext)?.encode())
}

/// Decrypt an encoded envelope. Absent on malformed input or a wrong key.
pub fn decrypt_payload(envelope: &str, key: &SymmetricKey) -> Option<Vec<u8>> {
    let parsed = Envelope::parse(envelope)?;
    let plaintext = open(key, &parsed);
    if plaintext.is_none() {
        tracing::debug!("payload failed authentication");
    }
    plaintext
}

pub fn encrypt_text(message: &str, key: &SymmetricKey) -> ShcResult<String> {
    encrypt_payload(message.as_bytes(), key)
}

/// Decrypt a text message; non-UTF-8 plaintext is treated as absent.
pub fn decrypt_text(envelope: &str, key: &SymmetricKey) -> Option<String> {
    String::from_utf8(decrypt_payload(envelope, key)?).ok()
}
