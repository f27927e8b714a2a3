//! Offer/answer state machine.
//!
//! The negotiator drives a [`NegotiationEngine`] through one offer/answer
//! cycle. Local descriptions leave as encrypted envelope text for the
//! operator to relay; remote descriptions arrive the same way.
//!
//! ```text
//! Idle ──start_offer──▶ Offering ──▶ AwaitingRemote ──answer──▶ Connected
//!   └──────offer──────▶ AnsweringPending ───────────────────────▶ Connected
//! ```
//!
//! Every failed transition leaves the state where it was before the call.
//! The one exception is a superseding offer: once the previous session has
//! been abandoned, a failure returns to `Idle`.

use std::sync::Arc;
use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use protocol::{EnvelopeCodec, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::registry::{BroadcastReport, ChannelRegistry};
use super::{ConnectionState, EngineEvent, NegotiationEngine};

/// Default label for the channel created by `start_offer`.
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

/// Default bound on candidate gathering.
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Negotiation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingRemote,
    AnsweringPending,
    Connected,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingRemote => "awaiting remote answer",
            NegotiationState::AnsweringPending => "answering",
            NegotiationState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What to do with an incoming offer while a previous cycle is in flight or
/// already connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReofferPolicy {
    /// Abandon the previous cycle and answer the new offer.
    #[default]
    Supersede,
    /// Refuse the new offer and keep the previous cycle.
    Reject,
}

/// Tunables for a [`SessionNegotiator`].
#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    /// Label of the channel created when offering.
    pub channel_label: String,
    /// Maximum wait for candidate gathering.
    pub gather_timeout: Duration,
    /// Handling of offers received mid-cycle.
    pub reoffer_policy: ReofferPolicy,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        Self {
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            reoffer_policy: ReofferPolicy::default(),
        }
    }
}

/// Drives offer/answer negotiation and tracks the resulting channels.
pub struct SessionNegotiator {
    engine: Arc<dyn NegotiationEngine>,
    codec: EnvelopeCodec,
    registry: Arc<ChannelRegistry>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    state: NegotiationState,
    options: NegotiatorOptions,
}

impl SessionNegotiator {
    /// Creates a negotiator and subscribes it to the engine's events.
    pub fn new(
        engine: Arc<dyn NegotiationEngine>,
        codec: EnvelopeCodec,
        registry: Arc<ChannelRegistry>,
        options: NegotiatorOptions,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        engine.subscribe(tx);

        Self {
            engine,
            codec,
            registry,
            events,
            state: NegotiationState::Idle,
            options,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Returns the channel registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Returns the engine this negotiator drives.
    pub fn engine(&self) -> &Arc<dyn NegotiationEngine> {
        &self.engine
    }

    /// Starts a negotiation as the offering side.
    ///
    /// Creates the local channel, produces the offer, waits for candidate
    /// gathering and returns the offer envelope to relay to the peer.
    pub async fn start_offer(&mut self) -> Result<String> {
        if self.state != NegotiationState::Idle {
            return Err(ProtocolError::NegotiationError(format!(
                "cannot start an offer while {}",
                self.state
            )));
        }

        self.transition(NegotiationState::Offering);
        match self.create_offer_envelope().await {
            Ok(envelope) => {
                self.transition(NegotiationState::AwaitingRemote);
                Ok(envelope)
            }
            Err(e) => {
                self.transition(NegotiationState::Idle);
                Err(e)
            }
        }
    }

    /// Handles an envelope pasted by the operator.
    ///
    /// Returns the answer envelope when the envelope carried an offer, and
    /// `None` when it carried an answer.
    pub async fn receive_envelope(&mut self, envelope_text: &str) -> Result<Option<String>> {
        let desc = self.codec.decode_description(envelope_text)?;
        tracing::debug!("received {} envelope while {}", desc.kind, self.state);

        match desc.kind {
            SdpKind::Offer => self.accept_offer(desc).await.map(Some),
            SdpKind::Answer => self.accept_answer(desc).await.map(|()| None),
            other => Err(ProtocolError::NegotiationError(format!(
                "unsupported session description kind '{}'",
                other
            ))),
        }
    }

    /// Sends a message on every registered channel.
    pub async fn broadcast(&self, message: &[u8]) -> Result<BroadcastReport> {
        self.registry.broadcast(message).await
    }

    /// Waits for the next engine event.
    ///
    /// Returns `None` once the engine has dropped every event sender.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Handles every engine event already queued, without waiting.
    ///
    /// Returns the number of events handled.
    pub async fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Applies one engine event.
    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Candidate(candidate) => {
                tracing::debug!("new ICE candidate: {}", candidate);
            }
            EngineEvent::RemoteChannel(channel) => {
                let label = channel.label().to_string();
                tracing::info!("new data channel from peer: {}", label);
                self.registry.register(&label, channel).await;
            }
            EngineEvent::ChannelOpen { label } => {
                tracing::info!("data channel '{}' is open", label);
            }
            EngineEvent::ChannelClosed { label, id } => {
                if self.registry.remove_instance(&label, id).await.is_some() {
                    tracing::warn!("data channel '{}' closed", label);
                } else {
                    tracing::debug!("stale data channel '{}' ({}) closed", label, id);
                }
            }
            EngineEvent::Message { label, payload } => {
                self.registry.on_message(&label, &payload);
            }
            EngineEvent::ConnectionState(state) => match state {
                ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed => {
                    tracing::warn!("peer connection state changed: {:?}", state);
                }
                _ => tracing::debug!("peer connection state changed: {:?}", state),
            },
        }
    }

    async fn create_offer_envelope(&self) -> Result<String> {
        let label = self.options.channel_label.clone();
        let channel = self.engine.create_local_channel(&label).await?;
        self.registry.register(&label, channel.clone()).await;

        let result = async {
            let offer = self.engine.create_offer().await?;
            self.engine.set_local_description(offer).await?;
            let local = self.gather_local_description().await?;
            self.codec.encode_description(&local)
        }
        .await;

        if result.is_err() {
            self.registry.remove(&label).await;
            if let Err(e) = channel.close().await {
                tracing::debug!("failed to close abandoned channel '{}': {}", label, e);
            }
        }
        result
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<String> {
        let mut previous = self.state;
        if matches!(
            previous,
            NegotiationState::AwaitingRemote | NegotiationState::Connected
        ) {
            match self.options.reoffer_policy {
                ReofferPolicy::Reject => {
                    return Err(ProtocolError::NegotiationError(format!(
                        "refusing new offer while {}",
                        previous
                    )));
                }
                ReofferPolicy::Supersede => {
                    tracing::warn!("incoming offer supersedes the session that was {}", previous);
                    self.abandon_session().await?;
                    previous = NegotiationState::Idle;
                    self.transition(previous);
                }
            }
        }

        self.transition(NegotiationState::AnsweringPending);
        let result = async {
            self.engine.set_remote_description(offer).await?;
            let answer = self.engine.create_answer().await?;
            self.engine.set_local_description(answer).await?;
            let local = self.gather_local_description().await?;
            self.codec.encode_description(&local)
        }
        .await;

        match result {
            Ok(envelope) => {
                self.transition(NegotiationState::Connected);
                Ok(envelope)
            }
            Err(e) => {
                self.transition(previous);
                Err(e)
            }
        }
    }

    /// Drops the current session: the engine starts a fresh connection and
    /// every channel of the old one is closed and unregistered.
    async fn abandon_session(&self) -> Result<()> {
        self.engine.reset().await?;

        for (label, channel) in self.registry.clear().await {
            if let Err(e) = channel.close().await {
                tracing::debug!("failed to close superseded channel '{}': {}", label, e);
            }
        }
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.state != NegotiationState::AwaitingRemote {
            tracing::warn!("applying answer while {}", self.state);
        }
        self.engine.set_remote_description(answer).await?;
        self.transition(NegotiationState::Connected);
        Ok(())
    }

    /// Waits for gathering to finish, then reads back the final local
    /// description with its candidates.
    async fn gather_local_description(&self) -> Result<SessionDescription> {
        let timeout = self.options.gather_timeout;
        tokio::time::timeout(timeout, self.engine.await_gathering_complete())
            .await
            .map_err(|_| {
                ProtocolError::NegotiationError(format!(
                    "candidate gathering did not complete within {:?}",
                    timeout
                ))
            })??;

        self.engine.local_description().await.ok_or_else(|| {
            ProtocolError::NegotiationError("no local description available".into())
        })
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            tracing::debug!("negotiation state: {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

impl std::fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("state", &self.state)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::registry::tests::MockChannel;
    use crate::network::{DataChannel, EventHub, EventSender};
    use crate::sink::ChannelSink;
    use futures_util::future::BoxFuture;
    use protocol::SecretKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::watch;

    /// Engine double producing synthetic descriptions.
    pub(crate) struct MockEngine {
        name: &'static str,
        hub: EventHub,
        local: Mutex<Option<SessionDescription>>,
        remote: Mutex<Option<SessionDescription>>,
        channels: Mutex<Vec<Arc<MockChannel>>>,
        gathered: watch::Receiver<bool>,
        resets: AtomicUsize,
        fail_offer: bool,
        fail_remote: bool,
    }

    impl MockEngine {
        fn new(name: &'static str) -> (Arc<Self>, watch::Sender<bool>) {
            let (gather_tx, gathered) = watch::channel(false);
            let engine = Arc::new(Self {
                name,
                hub: EventHub::new(),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                gathered,
                resets: AtomicUsize::new(0),
                fail_offer: false,
                fail_remote: false,
            });
            (engine, gather_tx)
        }

        /// An engine whose gathering has already completed.
        pub(crate) fn ready(name: &'static str) -> Arc<Self> {
            let (gather_tx, gathered) = watch::channel(true);
            drop(gather_tx);
            Arc::new(Self {
                name,
                hub: EventHub::new(),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                gathered,
                resets: AtomicUsize::new(0),
                fail_offer: false,
                fail_remote: false,
            })
        }

        fn with_failures(name: &'static str, fail_offer: bool, fail_remote: bool) -> Arc<Self> {
            let (gather_tx, gathered) = watch::channel(true);
            drop(gather_tx);
            Arc::new(Self {
                name,
                hub: EventHub::new(),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                gathered,
                resets: AtomicUsize::new(0),
                fail_offer,
                fail_remote,
            })
        }

        pub(crate) fn emit(&self, event: EngineEvent) {
            self.hub.emit(event);
        }

        /// True while a local offer is waiting for its answer.
        fn has_local_offer(&self) -> bool {
            let local = self.local.lock().unwrap();
            let remote = self.remote.lock().unwrap();
            matches!(local.as_ref(), Some(desc) if desc.kind == SdpKind::Offer)
                && !matches!(remote.as_ref(), Some(desc) if desc.kind == SdpKind::Answer)
        }
    }

    impl NegotiationEngine for MockEngine {
        fn create_local_channel<'a>(
            &'a self,
            label: &'a str,
        ) -> BoxFuture<'a, Result<Arc<dyn DataChannel>>> {
            Box::pin(async move {
                let channel = MockChannel::new(label);
                self.channels.lock().unwrap().push(channel.clone());
                Ok(channel as Arc<dyn DataChannel>)
            })
        }

        fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
            Box::pin(async move {
                if self.fail_offer {
                    return Err(ProtocolError::NegotiationError("offer rejected".into()));
                }
                Ok(SessionDescription::offer(format!("v=0\r\ns={}-offer\r\n", self.name)))
            })
        }

        fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
            Box::pin(async move {
                match self.remote.lock().unwrap().as_ref() {
                    Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(
                        format!("v=0\r\ns={}-answer\r\n", self.name),
                    )),
                    _ => Err(ProtocolError::NegotiationError("no remote offer".into())),
                }
            })
        }

        fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                *self.local.lock().unwrap() = Some(desc);
                Ok(())
            })
        }

        fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if self.fail_remote {
                    return Err(ProtocolError::NegotiationError("remote rejected".into()));
                }
                if desc.kind == SdpKind::Offer && self.has_local_offer() {
                    return Err(ProtocolError::NegotiationError(
                        "remote offer while a local offer is pending".into(),
                    ));
                }
                *self.remote.lock().unwrap() = Some(desc);
                Ok(())
            })
        }

        fn await_gathering_complete(&self) -> BoxFuture<'_, Result<()>> {
            let mut gathered = self.gathered.clone();
            Box::pin(async move {
                // A dropped sender after `true` counts as complete.
                let _ = gathered.wait_for(|done| *done).await;
                if *gathered.borrow() {
                    Ok(())
                } else {
                    Err(ProtocolError::NegotiationError("gathering aborted".into()))
                }
            })
        }

        fn local_description(&self) -> BoxFuture<'_, Option<SessionDescription>> {
            Box::pin(async move {
                self.local.lock().unwrap().clone().map(|mut desc| {
                    desc.sdp.push_str("a=candidate:1 1 udp 1 127.0.0.1 9 typ host\r\n");
                    desc
                })
            })
        }

        fn subscribe(&self, events: EventSender) {
            self.hub.subscribe(events);
        }

        fn reset(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.resets.fetch_add(1, Ordering::SeqCst);
                *self.local.lock().unwrap() = None;
                *self.remote.lock().unwrap() = None;
                for channel in self.channels.lock().unwrap().iter() {
                    channel.closed.store(true, Ordering::SeqCst);
                }
                Ok(())
            })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(SecretKey::fallback())
    }

    fn negotiator(engine: Arc<MockEngine>) -> SessionNegotiator {
        negotiator_with(engine, NegotiatorOptions::default())
    }

    fn negotiator_with(engine: Arc<MockEngine>, options: NegotiatorOptions) -> SessionNegotiator {
        let (sink, _rx) = ChannelSink::new();
        let registry = Arc::new(ChannelRegistry::new(Arc::new(sink)));
        SessionNegotiator::new(engine, codec(), registry, options)
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let negotiator = negotiator(MockEngine::ready("a"));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_start_offer_waits_for_gathering() {
        let (engine, gather_tx) = MockEngine::new("a");
        let mut negotiator = negotiator(engine);

        let offering = tokio::spawn(async move {
            let envelope = negotiator.start_offer().await;
            (negotiator, envelope)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!offering.is_finished());

        gather_tx.send(true).unwrap();
        let (negotiator, envelope) = offering.await.unwrap();
        let envelope = envelope.unwrap();

        assert_eq!(negotiator.state(), NegotiationState::AwaitingRemote);
        let decoded: serde_json::Value =
            serde_json::from_str(&codec().decode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded["type"], "offer");
        assert!(decoded["sdp"].as_str().unwrap().contains("a=candidate"));
    }

    #[tokio::test]
    async fn test_start_offer_registers_local_channel() {
        let mut negotiator = negotiator(MockEngine::ready("a"));
        negotiator.start_offer().await.unwrap();

        assert_eq!(negotiator.registry().labels().await, vec![DEFAULT_CHANNEL_LABEL]);
    }

    #[tokio::test]
    async fn test_start_offer_uses_configured_label() {
        let options = NegotiatorOptions {
            channel_label: "ops".into(),
            ..Default::default()
        };
        let mut negotiator = negotiator_with(MockEngine::ready("a"), options);
        negotiator.start_offer().await.unwrap();

        assert!(negotiator.registry().get("ops").await.is_some());
    }

    #[tokio::test]
    async fn test_start_offer_twice_is_rejected() {
        let mut negotiator = negotiator(MockEngine::ready("a"));
        negotiator.start_offer().await.unwrap();

        let result = negotiator.start_offer().await;
        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::AwaitingRemote);
    }

    #[tokio::test]
    async fn test_start_offer_failure_returns_to_idle_without_channel() {
        let engine = MockEngine::with_failures("a", true, false);
        let mut negotiator = negotiator(engine.clone());

        let result = negotiator.start_offer().await;

        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
        assert!(negotiator.registry().is_empty().await);
        let channels = engine.channels.lock().unwrap();
        assert!(channels[0].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_offer_retry_after_failure() {
        let (engine, gather_tx) = MockEngine::new("a");
        let options = NegotiatorOptions {
            gather_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut negotiator = negotiator_with(engine, options);

        assert!(negotiator.start_offer().await.is_err());
        assert_eq!(negotiator.state(), NegotiationState::Idle);

        gather_tx.send(true).unwrap();
        assert!(negotiator.start_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_gathering_timeout_is_negotiation_error() {
        let (engine, _gather_tx) = MockEngine::new("a");
        let options = NegotiatorOptions {
            gather_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut negotiator = negotiator_with(engine, options);

        let result = negotiator.start_offer().await;
        match result {
            Err(ProtocolError::NegotiationError(msg)) => assert!(msg.contains("gathering")),
            other => panic!("expected gathering timeout, got {:?}", other),
        }
        assert!(negotiator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_offer_answer_scenario() {
        let mut offerer = negotiator(MockEngine::ready("alice"));
        let mut answerer = negotiator(MockEngine::ready("bob"));

        let offer_envelope = offerer.start_offer().await.unwrap();

        // Relay through a decode/re-encode, as a human would through any tool.
        let offer_json = codec().decode(&offer_envelope).unwrap();
        let relayed = codec().encode(&offer_json).unwrap();

        let answer_envelope = answerer.receive_envelope(&relayed).await.unwrap().unwrap();
        assert_eq!(answerer.state(), NegotiationState::Connected);

        let answer: serde_json::Value =
            serde_json::from_str(&codec().decode(&answer_envelope).unwrap()).unwrap();
        assert_eq!(answer["type"], "answer");

        let reply = offerer.receive_envelope(&answer_envelope).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(offerer.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_answer_while_idle_is_applied() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());
        let envelope = codec()
            .encode_description(&SessionDescription::answer("v=0\r\n"))
            .unwrap();

        assert!(negotiator.receive_envelope(&envelope).await.unwrap().is_none());
        assert_eq!(negotiator.state(), NegotiationState::Connected);
        assert_eq!(engine.remote.lock().unwrap().as_ref().unwrap().kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn test_answer_rejected_by_engine_keeps_state() {
        let mut negotiator = negotiator(MockEngine::with_failures("a", false, true));
        negotiator.start_offer().await.unwrap();

        let envelope = codec()
            .encode_description(&SessionDescription::answer("v=0\r\n"))
            .unwrap();
        let result = negotiator.receive_envelope(&envelope).await;

        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::AwaitingRemote);
    }

    #[tokio::test]
    async fn test_bad_envelope_keeps_state() {
        let mut negotiator = negotiator(MockEngine::ready("a"));
        negotiator.start_offer().await.unwrap();

        let truncated = negotiator.receive_envelope("").await;
        assert!(matches!(truncated, Err(ProtocolError::Truncated { .. })));

        let other_key = EnvelopeCodec::new(SecretKey::from_bytes([1u8; 32]));
        let forged = other_key
            .encode_description(&SessionDescription::answer("v=0\r\n"))
            .unwrap();
        let forged = negotiator.receive_envelope(&forged).await;
        assert!(matches!(forged, Err(ProtocolError::AuthenticationFailed)));

        assert_eq!(negotiator.state(), NegotiationState::AwaitingRemote);
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_rejected() {
        let mut negotiator = negotiator(MockEngine::ready("a"));
        let envelope = codec().encode(r#"{"type":"rollback","sdp":""}"#).unwrap();

        let result = negotiator.receive_envelope(&envelope).await;
        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_reoffer_superseded_by_default() {
        let mut negotiator = negotiator(MockEngine::ready("a"));
        let offer = codec()
            .encode_description(&SessionDescription::offer("v=0\r\n"))
            .unwrap();

        negotiator.receive_envelope(&offer).await.unwrap();
        assert_eq!(negotiator.state(), NegotiationState::Connected);

        let second = negotiator.receive_envelope(&offer).await.unwrap();
        assert!(second.is_some());
        assert_eq!(negotiator.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_offer_supersedes_pending_local_offer() {
        let engine = MockEngine::ready("bob");
        let mut bob = negotiator(engine.clone());
        let mut alice = negotiator(MockEngine::ready("alice"));

        // Both sides offered at once.
        bob.start_offer().await.unwrap();
        let offer = alice.start_offer().await.unwrap();

        let answer = bob.receive_envelope(&offer).await.unwrap().unwrap();

        assert_eq!(bob.state(), NegotiationState::Connected);
        assert_eq!(engine.resets.load(Ordering::SeqCst), 1);
        assert!(bob.registry().is_empty().await);
        assert!(engine.channels.lock().unwrap()[0].closed.load(Ordering::SeqCst));

        assert!(alice.receive_envelope(&answer).await.unwrap().is_none());
        assert_eq!(alice.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_superseded_offer_channel_is_closed() {
        let engine = MockEngine::ready("bob");
        let mut bob = negotiator(engine.clone());
        bob.start_offer().await.unwrap();
        let own_channel = engine.channels.lock().unwrap()[0].clone();

        let offer = codec()
            .encode_description(&SessionDescription::offer("v=0\r\n"))
            .unwrap();
        bob.receive_envelope(&offer).await.unwrap();

        assert!(own_channel.closed.load(Ordering::SeqCst));
        assert!(bob.registry().get(DEFAULT_CHANNEL_LABEL).await.is_none());
        let result = bob.broadcast(b"hi").await;
        assert!(matches!(result, Err(ProtocolError::NoActiveChannels)));
    }

    #[tokio::test]
    async fn test_pending_offer_blocks_remote_offer_in_engine() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());
        negotiator.start_offer().await.unwrap();

        let result = engine
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await;
        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
    }

    #[tokio::test]
    async fn test_failed_supersede_returns_to_idle() {
        let engine = MockEngine::with_failures("a", false, true);
        let mut negotiator = negotiator(engine.clone());
        negotiator.start_offer().await.unwrap();

        let offer = codec()
            .encode_description(&SessionDescription::offer("v=0\r\n"))
            .unwrap();
        let result = negotiator.receive_envelope(&offer).await;

        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
        assert!(negotiator.registry().is_empty().await);
        assert!(negotiator.start_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_reoffer_rejected_by_policy() {
        let options = NegotiatorOptions {
            reoffer_policy: ReofferPolicy::Reject,
            ..Default::default()
        };
        let mut negotiator = negotiator_with(MockEngine::ready("a"), options);
        negotiator.start_offer().await.unwrap();

        let offer = codec()
            .encode_description(&SessionDescription::offer("v=0\r\n"))
            .unwrap();
        let result = negotiator.receive_envelope(&offer).await;

        assert!(matches!(result, Err(ProtocolError::NegotiationError(_))));
        assert_eq!(negotiator.state(), NegotiationState::AwaitingRemote);
    }

    #[tokio::test]
    async fn test_failed_answer_restores_previous_state() {
        let mut negotiator = negotiator(MockEngine::with_failures("a", false, true));
        let offer = codec()
            .encode_description(&SessionDescription::offer("v=0\r\n"))
            .unwrap();

        let result = negotiator.receive_envelope(&offer).await;
        assert!(result.is_err());
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_remote_channel_event_registers_channel() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());

        engine.emit(EngineEvent::Candidate("candidate:1 1 udp 1 10.0.0.1 9 typ host".into()));
        engine.emit(EngineEvent::RemoteChannel(MockChannel::new("files")));
        engine.emit(EngineEvent::ChannelOpen { label: "files".into() });

        assert_eq!(negotiator.process_events().await, 3);
        assert_eq!(negotiator.registry().labels().await, vec!["files"]);
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_channel_closed_event_removes_channel() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());

        let channel = MockChannel::new("chat");
        engine.emit(EngineEvent::RemoteChannel(channel.clone()));
        engine.emit(EngineEvent::ChannelClosed {
            label: "chat".into(),
            id: channel.id(),
        });
        negotiator.process_events().await;

        assert!(negotiator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_late_close_keeps_replacement_channel() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());
        let old = MockChannel::new("chat");
        let new = MockChannel::new("chat");

        engine.emit(EngineEvent::RemoteChannel(old.clone()));
        engine.emit(EngineEvent::RemoteChannel(new.clone()));
        engine.emit(EngineEvent::ChannelClosed {
            label: "chat".into(),
            id: old.id(),
        });
        assert_eq!(negotiator.process_events().await, 3);

        assert_eq!(negotiator.registry().labels().await, vec!["chat"]);
        let report = negotiator.broadcast(b"still here").await.unwrap();
        assert_eq!(report.delivered(), 1);
        assert_eq!(new.sent.lock().unwrap().as_slice(), &[b"still here".to_vec()]);
        assert_eq!(old.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_message_event_reaches_sink() {
        let engine = MockEngine::ready("a");
        let (sink, mut rx) = ChannelSink::new();
        let registry = Arc::new(ChannelRegistry::new(Arc::new(sink)));
        let mut negotiator =
            SessionNegotiator::new(engine.clone(), codec(), registry, NegotiatorOptions::default());

        engine.emit(EngineEvent::RemoteChannel(MockChannel::new("chat")));
        engine.emit(EngineEvent::Message {
            label: "chat".into(),
            payload: b"hello".to_vec(),
        });

        let event = negotiator.next_event().await.unwrap();
        negotiator.handle_event(event).await;
        let event = negotiator.next_event().await.unwrap();
        negotiator.handle_event(event).await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.origin, "chat");
        assert_eq!(message.payload, b"hello");
    }

    #[tokio::test]
    async fn test_broadcast_without_channels() {
        let negotiator = negotiator(MockEngine::ready("a"));
        let result = negotiator.broadcast(b"hi").await;
        assert!(matches!(result, Err(ProtocolError::NoActiveChannels)));
    }

    #[tokio::test]
    async fn test_broadcast_after_offer_uses_local_channel() {
        let engine = MockEngine::ready("a");
        let mut negotiator = negotiator(engine.clone());
        negotiator.start_offer().await.unwrap();

        let report = negotiator.broadcast(b"hi").await.unwrap();
        assert_eq!(report.delivered(), 1);
        let channels = engine.channels.lock().unwrap();
        assert_eq!(channels[0].sent.lock().unwrap().as_slice(), &[b"hi".to_vec()]);
    }
}
