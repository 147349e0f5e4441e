//! shc-crypto: client-side E2E encryption for shadowchat
//!
//! Key hierarchy:
//! ```text
//! Password ──PBKDF2-SHA256(salt = username)──> Wrapping Key (AES-256-GCM)
//!   └── wraps Identity Private Key (RSA-OAEP-SHA256, JWK, envelope-encrypted)
//!         └── unwraps Chat Keys (AES-256-GCM, one per conversation, RSA-OAEP per recipient)
//!               └── Envelope: base64(iv) "." base64(ciphertext || tag)
//! ```
//!
//! Decryption and unwrap paths return `Option`: a wrong key, a corrupt
//! envelope and malformed key material all collapse to `None`, and the
//! caller decides what absence means.

pub mod aead;
pub mod auth;
pub mod envelope;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod stream;
pub mod wrap;

pub use aead::{decrypt_payload, decrypt_text, encrypt_payload, encrypt_text};
pub use auth::hash_password_for_auth;
pub use envelope::{Envelope, EnvelopeFormat};
pub use identity::{
    export_public_key, generate_identity_key_pair, import_public_key, IdentityKeyPair,
};
pub use kdf::{derive_wrapping_key, KdfParams};
pub use keys::{generate_chat_key, SymmetricKey};
pub use stream::encrypt_large_file;
pub use wrap::{unwrap_key, unwrap_private_key, wrap_key_for_recipient, wrap_private_key};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM initialisation vector (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Default PBKDF2 rounds for the password wrapping key
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Default RSA modulus size for identity keys
pub const RSA_BITS: usize = 2048;
