//! One WebRTC answerer negotiation and the data channel it produces.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::{IceServer, rtc_ice_servers};
use crate::error::{P2pError, to_negotiation_error, to_setup_error};
use crate::guard::guard_callback;

/// Outbound half of signaling as seen by a peer session.
pub trait SignalSink: Send + Sync {
    fn send_answer(&self, sdp: &str, request_id: &str) -> Result<(), P2pError>;
    fn send_ice(&self, candidate: Value) -> Result<(), P2pError>;
}

/// Data channel lifecycle notifications. `on_open` fires at most once per
/// channel and `on_close` only after a matching `on_open`.
pub trait ChannelEvents: Send + Sync {
    fn on_open(&self, channel: Arc<dyn ByteChannel>);
    fn on_close(&self);
    fn on_message(&self, data: Bytes);
}

/// Reliable ordered byte stream handed to the application once open.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send(&self, data: Bytes) -> Result<(), P2pError>;
    async fn send_text(&self, text: String) -> Result<(), P2pError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn id(&self) -> &str;

    /// Applies a remote offer and sends the answer through the sink, stamped
    /// with `request_id`.
    async fn handle_offer(&self, sdp: &str, request_id: &str) -> Result<(), P2pError>;

    /// Late candidates for a closed session are accepted and dropped.
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), P2pError>;

    fn data_channel(&self) -> Option<Arc<dyn ByteChannel>>;

    async fn send(&self, data: Bytes) -> Result<(), P2pError> {
        match self.data_channel() {
            Some(channel) => channel.send(data).await,
            None => Err(P2pError::ChannelNotOpen),
        }
    }

    async fn send_text(&self, text: String) -> Result<(), P2pError> {
        match self.data_channel() {
            Some(channel) => channel.send_text(text).await,
            None => Err(P2pError::ChannelNotOpen),
        }
    }

    fn connection_state(&self) -> PeerState;

    async fn close(&self);
}

/// Builds peer sessions. The orchestrator goes through this seam so tests
/// can substitute sessions that never touch the network.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        sink: Arc<dyn SignalSink>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Arc<dyn PeerSession>, P2pError>;
}

pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[IceServer]) -> Self {
        Self {
            ice_servers: rtc_ice_servers(ice_servers),
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        sink: Arc<dyn SignalSink>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Arc<dyn PeerSession>, P2pError> {
        let peer: Arc<dyn PeerSession> =
            WebRtcPeer::create(self.ice_servers.clone(), sink, events).await?;
        Ok(peer)
    }
}

fn build_api(setting: SettingEngine) -> Result<API, P2pError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

type ChannelSlot = Arc<RwLock<Option<Arc<DataChannel>>>>;

pub struct WebRtcPeer {
    id: String,
    pc: Arc<RTCPeerConnection>,
    sink: Arc<dyn SignalSink>,
    channel: ChannelSlot,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub async fn create(
        ice_servers: Vec<RTCIceServer>,
        sink: Arc<dyn SignalSink>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Arc<Self>, P2pError> {
        Self::create_with_settings(ice_servers, SettingEngine::default(), sink, events).await
    }

    /// Like [`WebRtcPeer::create`] with explicit ICE/network settings.
    pub async fn create_with_settings(
        ice_servers: Vec<RTCIceServer>,
        setting: SettingEngine,
        sink: Arc<dyn SignalSink>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Arc<Self>, P2pError> {
        let api = build_api(setting)?;
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        let id = Uuid::new_v4().to_string();
        let channel: ChannelSlot = Arc::new(RwLock::new(None));

        let sink_for_ice = Arc::clone(&sink);
        let peer_for_ice = id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = Arc::clone(&sink_for_ice);
            let peer = peer_for_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "peerlink::peer", %peer, "ice gathering complete");
                    return;
                };
                let value = match candidate.to_json().map(serde_json::to_value) {
                    Ok(Ok(value)) => value,
                    Ok(Err(err)) => {
                        tracing::warn!(target = "peerlink::peer", %peer, error = %err, "failed to encode local candidate");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(target = "peerlink::peer", %peer, error = %err, "failed to serialize local candidate");
                        return;
                    }
                };
                if let Err(err) = sink.send_ice(value) {
                    tracing::debug!(
                        target = "peerlink::peer",
                        %peer,
                        error = %err,
                        "dropping local candidate"
                    );
                }
            })
        }));

        let peer_for_state = id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer_for_state.clone();
            Box::pin(async move {
                tracing::info!(
                    target = "peerlink::peer",
                    %peer,
                    state = %PeerState::from(state),
                    "peer connection state changed"
                );
            })
        }));

        let slot = Arc::clone(&channel);
        let peer_for_dc = id.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let events = Arc::clone(&events);
            let peer = peer_for_dc.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "peerlink::peer",
                    %peer,
                    label = %dc.label(),
                    "remote data channel announced"
                );
                attach_data_channel(dc, slot, events, peer);
            })
        }));

        Ok(Arc::new(Self {
            id,
            pc,
            sink,
            channel,
            closed: AtomicBool::new(false),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn attach_data_channel(
    dc: Arc<RTCDataChannel>,
    slot: ChannelSlot,
    events: Arc<dyn ChannelEvents>,
    peer: String,
) {
    let channel = Arc::new(DataChannel {
        inner: Arc::clone(&dc),
        open: AtomicBool::new(false),
    });
    slot.write().replace(Arc::clone(&channel));
    let handle: Weak<DataChannel> = Arc::downgrade(&channel);

    let open_handle = handle.clone();
    let open_events = Arc::clone(&events);
    let open_peer = peer.clone();
    dc.on_open(Box::new(move || {
        let handle = open_handle.clone();
        let events = Arc::clone(&open_events);
        let peer = open_peer.clone();
        Box::pin(async move {
            let Some(channel) = handle.upgrade() else {
                return;
            };
            if channel.open.swap(true, Ordering::SeqCst) {
                return;
            }
            tracing::info!(
                target = "peerlink::peer",
                %peer,
                label = %channel.label(),
                "data channel open"
            );
            let exposed: Arc<dyn ByteChannel> = channel;
            guard_callback("channel_open", || events.on_open(exposed));
        })
    }));

    let close_events = Arc::clone(&events);
    let close_peer = peer;
    dc.on_close(Box::new(move || {
        let handle = handle.clone();
        let events = Arc::clone(&close_events);
        let peer = close_peer.clone();
        Box::pin(async move {
            let Some(channel) = handle.upgrade() else {
                return;
            };
            if !channel.open.swap(false, Ordering::SeqCst) {
                return;
            }
            tracing::info!(target = "peerlink::peer", %peer, "data channel closed");
            guard_callback("channel_close", || events.on_close());
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = Arc::clone(&events);
        Box::pin(async move {
            tracing::trace!(
                target = "peerlink::peer",
                len = msg.data.len(),
                text = msg.is_string,
                "data channel message"
            );
            guard_callback("channel_message", || events.on_message(msg.data));
        })
    }));
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle_offer(&self, sdp: &str, request_id: &str) -> Result<(), P2pError> {
        if self.is_closed() {
            return Err(P2pError::Negotiation("peer session is closed".into()));
        }
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(to_negotiation_error)?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_negotiation_error)?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| P2pError::Negotiation("missing local description".into()))?;

        self.sink.send_answer(&local.sdp, request_id)?;
        tracing::info!(
            target = "peerlink::peer",
            peer = %self.id,
            request_id,
            "sent answer"
        );
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), P2pError> {
        if self.is_closed() {
            tracing::debug!(
                target = "peerlink::peer",
                peer = %self.id,
                "ignoring candidate for closed session"
            );
            return Ok(());
        }
        let init = match candidate {
            Value::String(candidate) => RTCIceCandidateInit {
                candidate,
                ..Default::default()
            },
            other => serde_json::from_value::<RTCIceCandidateInit>(other)
                .map_err(|err| P2pError::Negotiation(format!("invalid ice candidate: {err}")))?,
        };
        if init.candidate.is_empty() {
            tracing::debug!(
                target = "peerlink::peer",
                peer = %self.id,
                "remote end-of-candidates"
            );
            return Ok(());
        }
        match self.pc.add_ice_candidate(init).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_closed() => Ok(()),
            Err(err) => Err(to_negotiation_error(err)),
        }
    }

    fn data_channel(&self) -> Option<Arc<dyn ByteChannel>> {
        let channel = self.channel.read().clone()?;
        if !channel.is_open() {
            return None;
        }
        let channel: Arc<dyn ByteChannel> = channel;
        Some(channel)
    }

    fn connection_state(&self) -> PeerState {
        if self.is_closed() {
            PeerState::Closed
        } else {
            self.pc.connection_state().into()
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.open.store(false, Ordering::SeqCst);
            if let Err(err) = channel.inner.close().await {
                tracing::debug!(target = "peerlink::peer", peer = %self.id, error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "peerlink::peer", peer = %self.id, error = %err, "peer connection close failed");
        }
        tracing::info!(target = "peerlink::peer", peer = %self.id, "peer session closed");
    }
}

/// Handle over an `RTCDataChannel`. Writes after close report
/// [`P2pError::ChannelNotOpen`] instead of surfacing the transport error.
pub struct DataChannel {
    inner: Arc<RTCDataChannel>,
    open: AtomicBool,
}

impl DataChannel {
    fn writable(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.inner.ready_state() == RTCDataChannelState::Open
    }

    fn write_error(&self, err: webrtc::Error) -> P2pError {
        if self.writable() {
            P2pError::Channel(err.to_string())
        } else {
            P2pError::ChannelNotOpen
        }
    }
}

#[async_trait]
impl ByteChannel for DataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.writable()
    }

    async fn send(&self, data: Bytes) -> Result<(), P2pError> {
        if !self.writable() {
            return Err(P2pError::ChannelNotOpen);
        }
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| self.write_error(err))
    }

    async fn send_text(&self, text: String) -> Result<(), P2pError> {
        if !self.writable() {
            return Err(P2pError::ChannelNotOpen);
        }
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| self.write_error(err))
    }
}
