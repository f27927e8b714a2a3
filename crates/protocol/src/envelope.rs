//! Encrypted signaling envelopes.
//!
//! Session descriptions travel between peers through an untrusted,
//! copy-pasted text channel. The envelope codec turns a JSON payload into a
//! single line of printable text and back.
//!
//! # Envelope Format
//!
//! ```text
//! base64( nonce[12] || AES-256-GCM( LZ4-frame( canonical JSON ) ) )
//! ```
//!
//! - Canonical JSON is compact with object keys sorted, so equivalent
//!   documents compress to identical bytes.
//! - The nonce is freshly drawn from the OS RNG for every envelope.
//! - The GCM tag (16 bytes) is the tail of the ciphertext.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::key::SecretKey;
use crate::sdp::SessionDescription;

/// AES-GCM nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Upper bound on the decompressed payload of a single envelope (1 MB).
pub const MAX_PLAINTEXT_SIZE: usize = 1024 * 1024;

/// Re-serializes a JSON document in canonical compact form.
///
/// Fails with [`ProtocolError::InvalidPayload`] if `json` is not valid JSON.
pub fn canonicalize(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ProtocolError::InvalidPayload(format!("invalid JSON: {}", e)))?;
    // serde_json's default map is ordered by key, which makes this canonical.
    Ok(serde_json::to_string(&value)?)
}

/// Encoder and decoder for signaling envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    key: SecretKey,
}

impl EnvelopeCodec {
    /// Creates a codec bound to the given key.
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    /// Encodes a JSON payload into envelope text.
    pub fn encode(&self, plain_json: &str) -> Result<String> {
        let canonical = canonicalize(plain_json)?;
        let compressed = compress(canonical.as_bytes())?;

        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| ProtocolError::CryptoFailure(format!("nonce generation failed: {}", e)))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), compressed.as_slice())
            .map_err(|e| ProtocolError::CryptoFailure(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64_STANDARD.encode(sealed))
    }

    /// Decodes envelope text back into canonical JSON.
    ///
    /// Leading and trailing whitespace is ignored, since envelopes are
    /// usually pasted by hand.
    pub fn decode(&self, envelope_text: &str) -> Result<String> {
        let sealed = BASE64_STANDARD
            .decode(envelope_text.trim())
            .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))?;

        if sealed.len() < NONCE_LENGTH {
            return Err(ProtocolError::Truncated {
                len: sealed.len(),
                min: NONCE_LENGTH,
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);

        let compressed = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::AuthenticationFailed)?;

        let plain = decompress(&compressed)?;
        String::from_utf8(plain)
            .map_err(|e| ProtocolError::CorruptPayload(format!("payload is not UTF-8: {}", e)))
    }

    /// Encodes a session description.
    pub fn encode_description(&self, desc: &SessionDescription) -> Result<String> {
        self.encode(&desc.to_json()?)
    }

    /// Decodes envelope text into a session description.
    pub fn decode_description(&self, envelope_text: &str) -> Result<SessionDescription> {
        let json = self.decode(envelope_text)?;
        SessionDescription::from_json(&json)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| ProtocolError::CryptoFailure(format!("invalid key: {}", e)))
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    compress_into(Vec::with_capacity(data.len()), data)
}

fn compress_into<W: Write>(writer: W, data: &[u8]) -> Result<W> {
    let mut encoder = FrameEncoder::new(writer);
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::CompressionFailure(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::CompressionFailure(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut plain = Vec::new();
    FrameDecoder::new(data)
        .take(MAX_PLAINTEXT_SIZE as u64 + 1)
        .read_to_end(&mut plain)
        .map_err(|e| ProtocolError::CorruptPayload(format!("decompression failed: {}", e)))?;

    if plain.len() > MAX_PLAINTEXT_SIZE {
        return Err(ProtocolError::CorruptPayload(format!(
            "payload exceeds {} bytes",
            MAX_PLAINTEXT_SIZE
        )));
    }
    Ok(plain)
}
