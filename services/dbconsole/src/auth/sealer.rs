//! Cookie sealer.
//!
//! # Purpose
//! Authenticated encryption for everything that leaves the process in a
//! cookie. AES-256-GCM under a process-wide key, a fresh 96-bit random nonce
//! per seal, and a per-payload purpose string bound in as associated data so
//! a session payload can never be opened as an identity payload.
//!
//! # Wire form
//! `base64url_nopad(version || nonce || ciphertext || tag)`.
//!
//! # Key invariants
//! - Any alteration of the sealed text yields [`SealError::Tampered`].
//! - A payload whose `issued_at` is older than the caller's maximum age, or
//!   too far in the future, yields [`SealError::Stale`] even when intact.
use crate::clock::{random_bytes, Clock, SharedClock};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const SEAL_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
/// Tolerated clock skew for `issued_at` stamps from the future.
const FUTURE_SKEW_SECS: u64 = 60;
const SECRET_PURPOSE: &[u8] = b"dbconsole/secret/v1";

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("sealed value failed integrity check")]
    Tampered,
    #[error("sealed value is too old")]
    Stale,
    #[error("sealed value was revoked")]
    Revoked,
    #[error("sealing failed")]
    Seal,
}

/// 256-bit sealing key. `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieKey([u8; 32]);

impl CookieKey {
    pub fn generate() -> Self {
        Self(random_bytes::<32>())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(text: &str) -> Result<Self, String> {
        let bytes = hex::decode(text.trim()).map_err(|err| format!("cookie key is not hex: {err}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| format!("cookie key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for CookieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieKey(<redacted>)")
    }
}

/// Anything that travels sealed inside a cookie.
pub trait SealedPayload: Serialize + DeserializeOwned {
    /// Associated data separating payload types.
    const PURPOSE: &'static [u8];

    /// Wall-clock seconds when the payload was minted.
    fn issued_at(&self) -> u64;
}

/// Body of the short-lived `session` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub sid: String,
    pub iat: u64,
    pub nonce: String,
}

impl SealedPayload for SessionCookie {
    const PURPOSE: &'static [u8] = b"dbconsole/session/v1";

    fn issued_at(&self) -> u64 {
        self.iat
    }
}

/// Body of the long-lived `identity` cookie. `pwd` is itself sealed with
/// [`Sealer::seal_secret`], so the password is never plain text even after
/// the outer layer is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCookie {
    pub usr: String,
    pub pwd: String,
    pub iat: u64,
    pub nonce: String,
}

impl SealedPayload for IdentityCookie {
    const PURPOSE: &'static [u8] = b"dbconsole/identity/v1";

    fn issued_at(&self) -> u64 {
        self.iat
    }
}

#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
    clock: SharedClock,
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

impl Sealer {
    pub fn new(key: &CookieKey, clock: SharedClock) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
            clock,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn seal<P: SealedPayload>(&self, payload: &P) -> Result<String, SealError> {
        let plaintext = serde_json::to_vec(payload).map_err(|_| SealError::Seal)?;
        self.seal_bytes(P::PURPOSE, &plaintext)
    }

    pub fn open<P: SealedPayload>(&self, sealed: &str, max_age: Duration) -> Result<P, SealError> {
        let plaintext = self.open_bytes(P::PURPOSE, sealed)?;
        let payload: P = serde_json::from_slice(&plaintext).map_err(|_| SealError::Tampered)?;
        let now = self.clock.unix_seconds();
        let issued = payload.issued_at();
        if issued > now.saturating_add(FUTURE_SKEW_SECS)
            || now.saturating_sub(issued) > max_age.as_secs()
        {
            return Err(SealError::Stale);
        }
        Ok(payload)
    }

    /// Seal a bare secret (the login password) for storage in a session or
    /// an identity cookie.
    pub fn seal_secret(&self, secret: &str) -> Result<String, SealError> {
        self.seal_bytes(SECRET_PURPOSE, secret.as_bytes())
    }

    pub fn open_secret(&self, sealed: &str) -> Result<String, SealError> {
        let bytes = self.open_bytes(SECRET_PURPOSE, sealed)?;
        let secret = String::from_utf8(bytes).map_err(|_| SealError::Tampered)?;
        if secret.is_empty() {
            return Err(SealError::Tampered);
        }
        Ok(secret)
    }

    fn seal_bytes(&self, purpose: &[u8], plaintext: &[u8]) -> Result<String, SealError> {
        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: purpose,
                },
            )
            .map_err(|_| SealError::Seal)?;
        let mut framed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        framed.push(SEAL_VERSION);
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(framed))
    }

    fn open_bytes(&self, purpose: &[u8], sealed: &str) -> Result<Vec<u8>, SealError> {
        let framed = URL_SAFE_NO_PAD
            .decode(sealed.as_bytes())
            .map_err(|_| SealError::Tampered)?;
        if framed.len() <= 1 + NONCE_LEN || framed[0] != SEAL_VERSION {
            return Err(SealError::Tampered);
        }
        let (nonce, ciphertext) = framed[1..].split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: purpose,
                },
            )
            .map_err(|_| SealError::Tampered)
    }
}
