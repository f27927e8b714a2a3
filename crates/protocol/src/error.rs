//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Envelope encoding errors
    /// The payload handed to the envelope codec is not valid JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Key setup, random nonce generation or encryption failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    // Envelope decoding errors
    /// The envelope text is not valid base64.
    #[error("invalid envelope encoding: {0}")]
    InvalidEncoding(String),

    /// The decoded envelope is shorter than the cipher nonce.
    #[error("envelope truncated: {len} bytes, need at least {min}")]
    Truncated {
        /// Number of bytes after text decoding.
        len: usize,
        /// Minimum number of bytes required.
        min: usize,
    },

    /// The ciphertext failed authentication (tampered, or wrong key).
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// The payload could not be compressed.
    #[error("compression failed: {0}")]
    CompressionFailure(String),

    /// The decrypted payload could not be decompressed or is not JSON.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    // Negotiation errors
    /// The negotiation engine rejected an operation, or the state machine
    /// cannot perform it in its current state.
    #[error("negotiation failed: {0}")]
    NegotiationError(String),

    // Channel errors
    /// Broadcast was requested with no registered channels.
    #[error("no active channels")]
    NoActiveChannels,

    /// A send on a single channel failed.
    #[error("send on channel '{label}' failed: {reason}")]
    ChannelSendFailure {
        /// Label of the channel that failed.
        label: String,
        /// Underlying failure description.
        reason: String,
    },

    // Connection errors
    /// A direct transport connection failed.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            _ => ProtocolError::ConnectionError(err.to_string()),
        }
    }
}
