//! Symmetric key material for signaling envelopes.
//!
//! A single [`SecretKey`] is resolved once at process start and shared
//! read-only by every envelope encode/decode for the lifetime of the process.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;

use crate::error::{ProtocolError, Result};

/// Length of the envelope key in bytes (AES-256).
pub const SECRET_KEY_LENGTH: usize = 32;

/// Built-in key used when no override is configured.
///
/// Anyone who knows this value can read and forge envelopes exchanged by
/// peers running the default configuration. Only suitable for tests and
/// local experiments.
pub const FALLBACK_SECRET_KEY: &[u8; SECRET_KEY_LENGTH] = b"mysecretkey32byteslong1234567890";

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Supplied by the operator (config file or environment).
    Override,
    /// The built-in [`FALLBACK_SECRET_KEY`].
    Fallback,
}

/// A fixed-length symmetric key used for all envelope encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_LENGTH]);

impl SecretKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the built-in fallback key.
    pub fn fallback() -> Self {
        Self(*FALLBACK_SECRET_KEY)
    }

    /// Parses an operator-supplied key.
    ///
    /// Accepts either exactly 32 raw bytes (the string itself is the key) or
    /// standard base64 that decodes to 32 bytes. Surrounding whitespace is
    /// ignored.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        if value.len() == SECRET_KEY_LENGTH {
            let mut key = [0u8; SECRET_KEY_LENGTH];
            key.copy_from_slice(value.as_bytes());
            return Ok(Self(key));
        }

        match BASE64_STANDARD.decode(value) {
            Ok(decoded) if decoded.len() == SECRET_KEY_LENGTH => {
                let mut key = [0u8; SECRET_KEY_LENGTH];
                key.copy_from_slice(&decoded);
                Ok(Self(key))
            }
            _ => Err(ProtocolError::CryptoFailure(format!(
                "secret key must be {} bytes or base64 of {} bytes, got {} characters",
                SECRET_KEY_LENGTH,
                SECRET_KEY_LENGTH,
                value.len()
            ))),
        }
    }

    /// Resolves the process key from an optional override.
    ///
    /// An empty override counts as unset. Without an override the fallback is
    /// used, unless `allow_fallback` is false, in which case resolution fails.
    pub fn resolve(override_value: Option<&str>, allow_fallback: bool) -> Result<(Self, KeySource)> {
        match override_value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Ok((Self::parse(value)?, KeySource::Override)),
            None if allow_fallback => Ok((Self::fallback(), KeySource::Fallback)),
            None => Err(ProtocolError::CryptoFailure(
                "no secret key configured and the fallback key is disabled".into(),
            )),
        }
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&"[REDACTED]").finish()
    }
}
