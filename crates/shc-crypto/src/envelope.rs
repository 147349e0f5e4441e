//! Envelope codec
//!
//! Compact form (everything this crate produces):
//! ```text
//! base64(iv[12]) "." base64(ciphertext || tag[16])
//! ```
//!
//! Legacy form (older wrapped private keys, read-only):
//! ```text
//! {"iv":[12 byte values],"data":[ciphertext || tag byte values]}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::{IV_SIZE, TAG_SIZE};

/// Separator between the IV and ciphertext halves of a compact envelope
pub const SEPARATOR: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Compact,
    LegacyJson,
}

/// A parsed AES-GCM envelope: IV plus ciphertext with the tag appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub format: EnvelopeFormat,
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    iv: Vec<u8>,
    data: Vec<u8>,
}

impl Envelope {
    pub fn new(iv: [u8; IV_SIZE], ciphertext: Vec<u8>) -> Self {
        Self {
            iv,
            ciphertext,
            format: EnvelopeFormat::Compact,
        }
    }

    /// Parse either envelope form. A string without the separator takes the
    /// legacy decode path rather than being rejected outright.
    pub fn parse(encoded: &str) -> Option<Self> {
        let encoded = encoded.trim();
        match encoded.split_once(SEPARATOR) {
            Some((iv_b64, ct_b64)) => Self::parse_compact(iv_b64, ct_b64),
            None => Self::parse_legacy(encoded),
        }
    }

    fn parse_compact(iv_b64: &str, ct_b64: &str) -> Option<Self> {
        let iv = STANDARD.decode(iv_b64).ok()?;
        let ciphertext = STANDARD.decode(ct_b64).ok()?;
        Self::checked(iv, ciphertext, EnvelopeFormat::Compact)
    }

    fn parse_legacy(encoded: &str) -> Option<Self> {
        let legacy: LegacyEnvelope = serde_json::from_str(encoded).ok()?;
        Self::checked(legacy.iv, legacy.data, EnvelopeFormat::LegacyJson)
    }

    fn checked(iv: Vec<u8>, ciphertext: Vec<u8>, format: EnvelopeFormat) -> Option<Self> {
        let iv: [u8; IV_SIZE] = iv.try_into().ok()?;
        if ciphertext.len() < TAG_SIZE {
            return None;
        }
        Some(Self {
            iv,
            ciphertext,
            format,
        })
    }

    /// Encode in compact form. Legacy envelopes are re-encoded compactly.
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}",
            STANDARD.encode(self.iv),
            STANDARD.encode(&self.ciphertext)
        )
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// True when `s` has exactly two non-empty base64 halves around one separator.
pub fn is_compact(s: &str) -> bool {
    let mut parts = s.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => {
            !a.is_empty()
                && !b.is_empty()
                && STANDARD.decode(a).is_ok()
                && STANDARD.decode(b).is_ok()
        }
        _ => false,
    }
}
