//! Network module for peer-to-peer sessions.
//!
//! This module provides both transport strategies:
//! - Negotiated WebRTC data channels, with offer/answer relayed out-of-band
//!   as encrypted envelopes ([`negotiation`], [`registry`], [`webrtc`])
//! - Direct TCP sessions with newline-delimited text ([`direct`])
//!
//! plus a WebSocket byte-echo [`relay`] usable as a signaling path.
//!
//! The negotiation engine is reached only through [`NegotiationEngine`].
//! Engine callbacks never touch session state directly: they push
//! [`EngineEvent`]s into a queue that the negotiator drains.

pub mod direct;
pub mod negotiation;
pub mod registry;
pub mod relay;
pub mod webrtc;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::error::Result;
use protocol::SessionDescription;
use tokio::sync::mpsc;

/// Pause before accepting again after a listener error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Calls `accept` until it succeeds, sleeping [`ACCEPT_RETRY_DELAY`] after
/// every failure so a persistent error (descriptor exhaustion) cannot spin.
pub(crate) async fn accept_with_retry<T, E, F, Fut>(what: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!("failed to accept {}: {}", what, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Identity of one channel instance, unique within the process.
///
/// Labels are reused across sessions; ids are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named, bidirectional message path established by the engine.
pub trait DataChannel: Send + Sync {
    /// Returns the channel label (unique within a session).
    fn label(&self) -> &str;

    /// Returns the identity of this channel instance.
    fn id(&self) -> ChannelId;

    /// Sends one complete message on the channel.
    fn send<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Closes the channel.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Connectivity state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An asynchronous notification from the negotiation engine.
#[derive(Clone)]
pub enum EngineEvent {
    /// A local connectivity candidate was discovered.
    Candidate(String),
    /// The remote peer created a channel.
    RemoteChannel(Arc<dyn DataChannel>),
    /// A channel finished opening.
    ChannelOpen { label: String },
    /// The channel instance `id` was closed permanently.
    ChannelClosed { label: String, id: ChannelId },
    /// A channel received one message.
    Message { label: String, payload: Vec<u8> },
    /// The overall connection changed state.
    ConnectionState(ConnectionState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Candidate(candidate) => f.debug_tuple("Candidate").field(candidate).finish(),
            EngineEvent::RemoteChannel(channel) => {
                f.debug_tuple("RemoteChannel").field(&channel.label()).finish()
            }
            EngineEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            EngineEvent::ChannelClosed { label, id } => f
                .debug_struct("ChannelClosed")
                .field("label", label)
                .field("id", id)
                .finish(),
            EngineEvent::Message { label, payload } => f
                .debug_struct("Message")
                .field("label", label)
                .field("len", &payload.len())
                .finish(),
            EngineEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
        }
    }
}

/// Sending half of an engine event queue.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Fan-out of engine events to every registered observer.
///
/// Engines clone the hub into their callbacks; emitting never blocks and
/// observers whose queue was dropped are forgotten.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<EventSender>>>,
}

impl EventHub {
    /// Creates a hub with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer.
    pub fn subscribe(&self, events: EventSender) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events);
    }

    /// Delivers an event to every live observer.
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of live observers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// The narrow interface the core uses to drive a negotiation engine.
///
/// Implementations own candidate gathering and connectivity; the core only
/// moves session descriptions around and reacts to [`EngineEvent`]s.
pub trait NegotiationEngine: Send + Sync {
    /// Creates a channel initiated by this side.
    fn create_local_channel<'a>(&'a self, label: &'a str)
        -> BoxFuture<'a, Result<Arc<dyn DataChannel>>>;

    /// Produces a local offer.
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>>;

    /// Produces a local answer to the current remote offer.
    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>>;

    /// Applies a local description and starts candidate gathering.
    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>>;

    /// Applies the remote peer's description.
    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>>;

    /// Resolves once local candidate gathering has finished.
    fn await_gathering_complete(&self) -> BoxFuture<'_, Result<()>>;

    /// Returns the current local description, including gathered candidates.
    fn local_description(&self) -> BoxFuture<'_, Option<SessionDescription>>;

    /// Registers an observer for engine events.
    fn subscribe(&self, events: EventSender);

    /// Abandons the current connection, closing its channels, and starts
    /// over with a fresh one. Observers stay subscribed.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;

    /// Tears down the underlying connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

// Re-export key types
pub use direct::{DirectListener, ReceiveEnd, SendEnd, SessionReport, DEFAULT_READ_BUFFER_SIZE};
pub use negotiation::{NegotiationState, NegotiatorOptions, ReofferPolicy, SessionNegotiator};
pub use registry::{BroadcastReport, ChannelRegistry};
pub use relay::{RelayServer, RELAY_PATH};
pub use webrtc::{WebRtcConfig, WebRtcEngine};
