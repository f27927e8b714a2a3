//! # p2p-chat Peer Library
//!
//! This crate provides the peer side of p2p-chat: it negotiates WebRTC data
//! channels by exchanging encrypted envelopes over any out-of-band relay
//! (usually the operator's clipboard), broadcasts operator messages on every
//! open channel, and offers a plain TCP mode for peers that can reach each
//! other directly.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                  Dispatcher (chat mode)                    │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐   ┌───────────────────────────┐  │
//! │  │  SessionNegotiator   │──▶│     ChannelRegistry       │  │
//! │  └──────────┬───────────┘   └─────────────┬─────────────┘  │
//! │             │ EngineEvent                 │ MessageSink    │
//! │  ┌──────────┴───────────┐   ┌─────────────┴─────────────┐  │
//! │  │    WebRtcEngine      │   │   stdout / test capture   │  │
//! │  └──────────────────────┘   └───────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//!
//!   DirectListener / connect ── run_session (raw TCP lines)
//!   RelayServer ─────────────── WebSocket byte echo
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peer::config::Config;
//! use peer::network::{ChannelRegistry, SessionNegotiator, WebRtcEngine};
//! use peer::sink::StdoutSink;
//! use protocol::EnvelopeCodec;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let (key, _) = config.resolve_key()?;
//!
//!     let engine = Arc::new(WebRtcEngine::new(config.webrtc_config()).await?);
//!     let registry = Arc::new(ChannelRegistry::new(Arc::new(StdoutSink::channels())));
//!     let mut negotiator = SessionNegotiator::new(
//!         engine,
//!         EnvelopeCodec::new(key),
//!         registry,
//!         config.negotiator_options(),
//!     );
//!
//!     let offer = negotiator.start_offer().await?;
//!     println!("{}", offer);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`dispatcher`]: Interactive chat commands
//! - [`network`]: Negotiation, channel registry, WebRTC engine, direct
//!   transport and relay
//! - [`sink`]: Destinations for inbound messages

pub mod config;
pub mod dispatcher;
pub mod network;
pub mod sink;

pub use config::Config;
pub use dispatcher::{Command, Dispatcher, Reply};
pub use sink::{ChannelSink, InboundMessage, MessageSink, StdoutSink};
