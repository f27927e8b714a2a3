//! WebRTC negotiation engine.
//!
//! This module adapts a `webrtc` peer connection to [`NegotiationEngine`]:
//! - STUN server configuration
//! - Offer/answer and local/remote descriptions
//! - Gathering completion as an awaitable signal
//! - Data channel creation, with open/message/close callbacks forwarded as
//!   [`EngineEvent`]s

use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::{SdpKind, SessionDescription};
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelId, ConnectionState, DataChannel, EngineEvent, EventHub, EventSender, NegotiationEngine,
};

/// Default STUN servers for ICE connectivity.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Configuration for the WebRTC engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    /// STUN server URLs. Empty means host candidates only.
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self::from_stun_urls(DEFAULT_STUN_SERVERS.iter().copied())
    }
}

impl WebRtcConfig {
    /// Creates a configuration from STUN server URLs.
    pub fn from_stun_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stun_servers: urls.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a configuration without ICE servers (local network only).
    pub fn host_only() -> Self {
        Self {
            stun_servers: Vec::new(),
        }
    }

    /// One ICE server entry per STUN URL.
    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// A WebRTC data channel exposed as a [`DataChannel`].
pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
    id: ChannelId,
}

impl WebRtcChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            inner,
            id: ChannelId::next(),
        }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn id(&self) -> ChannelId {
        self.id
    }

    fn send<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Text when possible, so browser peers receive strings.
            let sent = match std::str::from_utf8(payload) {
                Ok(text) => self.inner.send_text(text.to_owned()).await,
                Err(_) => self.inner.send(&bytes::Bytes::copy_from_slice(payload)).await,
            };

            sent.map(|_| ()).map_err(|e| ProtocolError::ChannelSendFailure {
                label: self.inner.label().to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.close().await.map_err(|e| {
                ProtocolError::NegotiationError(format!("failed to close data channel: {}", e))
            })
        })
    }
}

/// Negotiation engine backed by one WebRTC peer connection at a time.
pub struct WebRtcEngine {
    /// Factory for replacement connections.
    api: API,
    /// Configuration every connection is created with.
    rtc_config: RTCConfiguration,
    /// The current peer connection.
    peer_connection: RwLock<Arc<RTCPeerConnection>>,
    /// Observers of engine events.
    events: EventHub,
    /// Gathering completion signal armed by the last `set_local_description`.
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

impl WebRtcEngine {
    /// Creates a new engine.
    ///
    /// This sets up the WebRTC API and creates a peer connection with the given configuration.
    pub async fn new(config: WebRtcConfig) -> Result<Self> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            ProtocolError::NegotiationError(format!("failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            ProtocolError::NegotiationError(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = config.to_rtc_configuration();
        let events = EventHub::new();
        let peer_connection = open_connection(&api, &rtc_config, &events).await?;

        Ok(Self {
            api,
            rtc_config,
            peer_connection: RwLock::new(peer_connection),
            events,
            gathering: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.read().await.clone()
    }
}

/// Creates a peer connection whose callbacks feed `events`.
async fn open_connection(
    api: &API,
    rtc_config: &RTCConfiguration,
    events: &EventHub,
) -> Result<Arc<RTCPeerConnection>> {
    let peer_connection = api
        .new_peer_connection(rtc_config.clone())
        .await
        .map_err(|e| {
            ProtocolError::NegotiationError(format!("failed to create peer connection: {}", e))
        })?;
    let peer_connection = Arc::new(peer_connection);
    install_handlers(&peer_connection, events);
    Ok(peer_connection)
}

/// Forwards peer connection callbacks into the event hub.
fn install_handlers(peer_connection: &RTCPeerConnection, hub: &EventHub) {
    let events = hub.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => events.emit(EngineEvent::Candidate(init.candidate)),
                Err(e) => tracing::debug!("unserializable ICE candidate: {}", e),
            }
        })
    }));

    let events = hub.clone();
    peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let events = events.clone();
        Box::pin(async move {
            // Register before wiring handlers so the channel is known
            // before any of its messages are queued.
            let wrapped = Arc::new(WebRtcChannel::new(channel.clone()));
            let id = wrapped.id();
            events.emit(EngineEvent::RemoteChannel(wrapped));
            wire_channel(&channel, id, &events);
        })
    }));

    let events = hub.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(state) = map_connection_state(state) {
                    events.emit(EngineEvent::ConnectionState(state));
                }
            })
        },
    ));
}

/// Forwards open, message and close callbacks of one channel.
fn wire_channel(channel: &Arc<RTCDataChannel>, id: ChannelId, events: &EventHub) {
    let label = channel.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            open_events.emit(EngineEvent::ChannelOpen { label: open_label });
        })
    }));

    let message_events = events.clone();
    let message_label = label.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        let label = message_label.clone();
        Box::pin(async move {
            events.emit(EngineEvent::Message {
                label,
                payload: msg.data.to_vec(),
            });
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = label.clone();
        Box::pin(async move {
            events.emit(EngineEvent::ChannelClosed { label, id });
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        other => {
            return Err(ProtocolError::NegotiationError(format!(
                "unsupported session description kind '{}'",
                other
            )))
        }
    };
    parsed.map_err(|e| ProtocolError::NegotiationError(format!("invalid SDP: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(ProtocolError::NegotiationError(format!(
                "engine produced a description of type {:?}",
                other
            )))
        }
    };
    Ok(SessionDescription { kind, sdp: desc.sdp })
}

impl NegotiationEngine for WebRtcEngine {
    fn create_local_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn DataChannel>>> {
        Box::pin(async move {
            let options = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = self
                .connection()
                .await
                .create_data_channel(label, Some(options))
                .await
                .map_err(|e| {
                    ProtocolError::NegotiationError(format!(
                        "failed to create data channel '{}': {}",
                        label, e
                    ))
                })?;

            let wrapped = WebRtcChannel::new(channel.clone());
            wire_channel(&channel, wrapped.id(), &self.events);
            Ok(Arc::new(wrapped) as Arc<dyn DataChannel>)
        })
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        Box::pin(async move {
            let offer = self.connection().await.create_offer(None).await.map_err(|e| {
                ProtocolError::NegotiationError(format!("failed to create offer: {}", e))
            })?;
            from_rtc_description(offer)
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        Box::pin(async move {
            let answer = self.connection().await.create_answer(None).await.map_err(|e| {
                ProtocolError::NegotiationError(format!("failed to create answer: {}", e))
            })?;
            from_rtc_description(answer)
        })
    }

    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;

            let peer_connection = self.connection().await;

            // Armed before gathering starts so completion cannot be missed.
            let gathered = peer_connection.gathering_complete_promise().await;
            *self.gathering.lock().await = Some(gathered);

            peer_connection
                .set_local_description(desc)
                .await
                .map_err(|e| {
                    ProtocolError::NegotiationError(format!(
                        "failed to set local description: {}",
                        e
                    ))
                })
        })
    }

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;
            self.connection()
                .await
                .set_remote_description(desc)
                .await
                .map_err(|e| {
                    ProtocolError::NegotiationError(format!(
                        "failed to set remote description: {}",
                        e
                    ))
                })
        })
    }

    fn await_gathering_complete(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let gathered = self.gathering.lock().await.take();
            let mut gathered = gathered.ok_or_else(|| {
                ProtocolError::NegotiationError("no local description has been set".into())
            })?;

            // The sender is dropped or fires once gathering is complete.
            let _ = gathered.recv().await;
            Ok(())
        })
    }

    fn local_description(&self) -> BoxFuture<'_, Option<SessionDescription>> {
        Box::pin(async move {
            let desc = self.connection().await.local_description().await?;
            match from_rtc_description(desc) {
                Ok(desc) => Some(desc),
                Err(e) => {
                    tracing::warn!("{}", e);
                    None
                }
            }
        })
    }

    fn subscribe(&self, events: EventSender) {
        self.events.subscribe(events);
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let fresh = open_connection(&self.api, &self.rtc_config, &self.events).await?;
            let stale = std::mem::replace(&mut *self.peer_connection.write().await, fresh);
            *self.gathering.lock().await = None;

            if let Err(e) = stale.close().await {
                tracing::debug!("failed to close abandoned peer connection: {}", e);
            }
            tracing::info!("peer connection reset");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connection().await.close().await.map_err(|e| {
                ProtocolError::NegotiationError(format!("failed to close connection: {}", e))
            })
        })
    }
}
