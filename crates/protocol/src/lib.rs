//! # p2p-chat Protocol Library
//!
//! This crate provides the signaling primitives shared by every p2p-chat
//! peer.
//!
//! ## Overview
//!
//! Peers negotiate a WebRTC session by relaying session descriptions by hand
//! (copy-paste, or a dumb echo relay). Anything on that path may be observed
//! or altered, so descriptions are wrapped in an encrypted envelope:
//!
//! - **Session Descriptions**: offer/answer payloads in the WebRTC JSON form
//! - **Secret Key**: the process-wide symmetric key and its resolution rules
//! - **Envelope Codec**: canonical JSON, LZ4 compression, AES-256-GCM, base64
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Session Description            │  {"type": ..., "sdp": ...}
//! ├─────────────────────────────────────────┤
//! │           Canonical JSON                │  compact, sorted keys
//! ├─────────────────────────────────────────┤
//! │           LZ4 Frame                     │
//! ├─────────────────────────────────────────┤
//! │           AES-256-GCM                   │  random 96-bit nonce
//! ├─────────────────────────────────────────┤
//! │           Base64 text                   │  relayed out-of-band
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{EnvelopeCodec, SecretKey, SessionDescription};
//!
//! let codec = EnvelopeCodec::new(SecretKey::fallback());
//!
//! let offer = SessionDescription::offer("v=0\r\n");
//! let envelope = codec.encode_description(&offer).unwrap();
//!
//! let received = codec.decode_description(&envelope).unwrap();
//! assert_eq!(received, offer);
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: Envelope encode/decode
//! - [`key`]: Secret key resolution
//! - [`sdp`]: Session description types
//! - [`error`]: Error types

pub mod envelope;
pub mod error;
pub mod key;
pub mod sdp;

pub use envelope::{canonicalize, EnvelopeCodec, MAX_PLAINTEXT_SIZE, NONCE_LENGTH, TAG_LENGTH};
pub use error::{ProtocolError, Result};
pub use key::{KeySource, SecretKey, FALLBACK_SECRET_KEY, SECRET_KEY_LENGTH};
pub use sdp::{SdpKind, SessionDescription};
