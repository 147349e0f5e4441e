//! RSA-OAEP identity key pairs and their JSON Web Key form
//!
//! Keys are exchanged as JWK (`kty: "RSA"`, `alg: "RSA-OAEP-256"`) so
//! envelopes stay interoperable with identities created by other clients.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use shc_core::{ShcError, ShcResult};
use zeroize::{Zeroize, Zeroizing};

const JWK_ALG: &str = "RSA-OAEP-256";

/// The user's long-lived key pair. The private half zeroizes on drop.
#[derive(Clone)]
pub struct IdentityKeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("bits", &(self.public.size() * 8))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh RSA key pair (e = 65537).
///
/// CPU-heavy; async callers should run it on a blocking thread.
pub fn generate_identity_key_pair(bits: usize) -> ShcResult<IdentityKeyPair> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| ShcError::Crypto(format!("RSA key generation failed: {e}")))?;
    let public = RsaPublicKey::from(&private);
    tracing::debug!(bits, "generated identity key pair");
    Ok(IdentityKeyPair { private, public })
}

#[derive(Debug, Serialize, Deserialize)]
struct RsaPublicJwk {
    kty: String,
    n: String,
    e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_ops: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct RsaPrivateJwk {
    kty: String,
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
    dp: String,
    dq: String,
    qi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_ops: Option<Vec<String>>,
}

impl Drop for RsaPrivateJwk {
    fn drop(&mut self) {
        self.d.zeroize();
        self.p.zeroize();
        self.q.zeroize();
        self.dp.zeroize();
        self.dq.zeroize();
        self.qi.zeroize();
    }
}

fn b64u(n: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(n.to_bytes_be())
}

fn from_b64u(s: &str) -> Option<BigUint> {
    let raw = Zeroizing::new(URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')).ok()?);
    Some(BigUint::from_bytes_be(&raw))
}

/// Export a public key as a JWK JSON string.
pub fn export_public_key(key: &RsaPublicKey) -> String {
    let jwk = RsaPublicJwk {
        kty: "RSA".into(),
        n: b64u(key.n()),
        e: b64u(key.e()),
        alg: Some(JWK_ALG.into()),
        ext: Some(true),
        key_ops: Some(vec!["encrypt".into()]),
    };
    serde_json::to_string(&jwk).unwrap_or_default()
}

/// Import a public key from a JWK JSON string.
pub fn import_public_key(json: &str) -> Option<RsaPublicKey> {
    let jwk: RsaPublicJwk = serde_json::from_str(json).ok()?;
    if jwk.kty != "RSA" {
        return None;
    }
    RsaPublicKey::new(from_b64u(&jwk.n)?, from_b64u(&jwk.e)?).ok()
}

/// Export the private key as a JWK JSON string, including CRT parameters.
pub fn export_private_key(key: &RsaPrivateKey) -> ShcResult<Zeroizing<String>> {
    let primes = key.primes();
    let (p, q) = match primes {
        [p, q] => (p, q),
        _ => {
            return Err(ShcError::Crypto(format!(
                "expected a two-prime RSA key, found {} primes",
                primes.len()
            )))
        }
    };
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);
    let d = key.d();
    let dp = d % &(p - &one);
    let dq = d % &(q - &one);
    // p is prime, so q^(p-2) mod p is the CRT coefficient q^-1 mod p
    let qi = q.modpow(&(p - &two), p);

    let jwk = RsaPrivateJwk {
        kty: "RSA".into(),
        n: b64u(key.n()),
        e: b64u(key.e()),
        d: b64u(d),
        p: b64u(p),
        q: b64u(q),
        dp: b64u(&dp),
        dq: b64u(&dq),
        qi: b64u(&qi),
        alg: Some(JWK_ALG.into()),
        ext: Some(true),
        key_ops: Some(vec!["decrypt".into()]),
    };
    serde_json::to_string(&jwk)
        .map(Zeroizing::new)
        .map_err(|e| ShcError::Crypto(format!("private key JWK encode failed: {e}")))
}

/// Import a private key from a JWK JSON string. Absent on malformed or
/// inconsistent key material.
pub fn import_private_key(json: &str) -> Option<RsaPrivateKey> {
    let jwk: RsaPrivateJwk = serde_json::from_str(json).ok()?;
    if jwk.kty != "RSA" {
        return None;
    }
    let key = RsaPrivateKey::from_components(
        from_b64u(&jwk.n)?,
        from_b64u(&jwk.e)?,
        from_b64u(&jwk.d)?,
        vec![from_b64u(&jwk.p)?, from_b64u(&jwk.q)?],
    )
    .ok()?;
    key.validate().ok()?;
    Some(key)
}
