//! Session orchestrator: the application-facing entry point.
//!
//! Each `connect` starts a new generation. Signaling and channel events are
//! delivered through adapters stamped with the generation (and, for channel
//! events, the peer sequence number) they were created for; anything arriving
//! for a superseded generation or peer is logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::P2pError;
use crate::peer::{
    ByteChannel, ChannelEvents, PeerFactory, PeerSession, PeerState, SignalSink, WebRtcPeerFactory,
};
use crate::protocol::{AppRegisteredPayload, AuthErrorPayload, AuthOkPayload};
use crate::signaling::{SignalingConfig, SignalingHandler, SignalingTransport};

const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Application-facing events. Every method has an empty default.
pub trait ClientEventHandler: Send + Sync {
    fn on_p2p_connected(&self) {}
    fn on_p2p_disconnected(&self) {}
    fn on_p2p_message(&self, _data: Bytes) {}
    fn on_p2p_error(&self, _error: &P2pError) {}
}

struct NoopHandler;

impl ClientEventHandler for NoopHandler {}

/// Invoked once per negotiated channel, before `on_p2p_connected`.
pub type ChannelReadyHook = Arc<dyn Fn(Arc<dyn ByteChannel>) + Send + Sync>;

pub struct P2pClientBuilder {
    config: ClientConfig,
    handler: Option<Arc<dyn ClientEventHandler>>,
    channel_ready: Option<ChannelReadyHook>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
}

impl P2pClientBuilder {
    pub fn handler(mut self, handler: Arc<dyn ClientEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn on_channel_ready<F>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn ByteChannel>) + Send + Sync + 'static,
    {
        self.channel_ready = Some(Arc::new(hook));
        self
    }

    pub fn peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    pub fn build(self) -> P2pClient {
        let factory: Arc<dyn PeerFactory> = match self.peer_factory {
            Some(factory) => factory,
            None => Arc::new(WebRtcPeerFactory::new(&self.config.ice_servers)),
        };
        let handler: Arc<dyn ClientEventHandler> = match self.handler {
            Some(handler) => handler,
            None => Arc::new(NoopHandler),
        };
        let (registered_generation, _) = watch::channel(None);
        P2pClient {
            inner: Arc::new(ClientInner {
                handler,
                registered_generation,
                channel_ready: self.channel_ready,
                factory,
                config: self.config,
                state: RwLock::new(ClientState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct CurrentPeer {
    seq: u64,
    session: Arc<dyn PeerSession>,
}

#[derive(Default)]
struct ClientState {
    generation: u64,
    peer_seq: u64,
    cancel: Option<CancellationToken>,
    signaling: Option<Arc<SignalingTransport>>,
    sink: Option<Arc<dyn SignalSink>>,
    peer: Option<CurrentPeer>,
    connected: bool,
    registered: bool,
    generation_registered: bool,
}

/// Resources detached from a superseded generation, released outside the lock.
struct Retired {
    cancel: Option<CancellationToken>,
    peer: Option<CurrentPeer>,
    signaling: Option<Arc<SignalingTransport>>,
}

impl ClientState {
    fn advance(&mut self) -> (u64, Retired) {
        self.generation += 1;
        self.connected = false;
        self.registered = false;
        self.generation_registered = false;
        self.sink = None;
        let retired = Retired {
            cancel: self.cancel.take(),
            peer: self.peer.take(),
            signaling: self.signaling.take(),
        };
        (self.generation, retired)
    }

    fn current_session(&self) -> Option<Arc<dyn PeerSession>> {
        self.peer.as_ref().map(|peer| Arc::clone(&peer.session))
    }
}

struct ClientInner {
    config: ClientConfig,
    handler: Arc<dyn ClientEventHandler>,
    channel_ready: Option<ChannelReadyHook>,
    factory: Arc<dyn PeerFactory>,
    state: RwLock<ClientState>,
    /// Latest generation that reached `app_registered`.
    registered_generation: watch::Sender<Option<u64>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct P2pClient {
    inner: Arc<ClientInner>,
}

impl P2pClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> P2pClientBuilder {
        P2pClientBuilder {
            config,
            handler: None,
            channel_ready: None,
            peer_factory: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Tears down whatever the previous generation left behind, then dials a
    /// fresh signaling transport. Errors from the dial are returned as-is;
    /// retrying is the caller's job.
    pub async fn connect(&self, parent: &CancellationToken) -> Result<(), P2pError> {
        self.inner.config.validate()?;
        if parent.is_cancelled() {
            return Err(P2pError::Cancelled);
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        let (generation, retired) = self.inner.state.write().advance();
        retire(retired).await;

        let cancel = parent.child_token();
        let adapter = Arc::new(SignalingAdapter {
            client: Arc::downgrade(&self.inner),
            generation,
        });
        let transport = SignalingTransport::new(
            SignalingConfig::from(&self.inner.config),
            adapter,
            &cancel,
        );
        {
            let mut state = self.inner.state.write();
            if state.generation != generation {
                drop(state);
                transport.close();
                return Err(P2pError::Cancelled);
            }
            state.cancel = Some(cancel);
            state.signaling = Some(Arc::clone(&transport));
            let sink: Arc<dyn SignalSink> = transport.clone();
            state.sink = Some(sink);
        }

        tracing::info!(
            target = "peerlink::client",
            generation,
            server = %self.inner.config.signaling_url,
            "connecting to signaling relay"
        );
        transport.connect().await
    }

    /// Cancels the current generation, closing the peer session before the
    /// signaling transport. Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let (generation, retired) = self.inner.state.write().advance();
        let had_connection = retired.signaling.is_some();
        retire(retired).await;
        if had_connection {
            tracing::info!(target = "peerlink::client", generation, "client closed");
        }
    }

    pub fn get_app_id(&self) -> String {
        self.inner
            .state
            .read()
            .signaling
            .as_ref()
            .and_then(|signaling| signaling.app_id())
            .unwrap_or_default()
    }

    /// True while a data channel from the current generation is open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.read().registered
    }

    /// Whether the current generation reached `app_registered` at any point.
    pub fn generation_registered(&self) -> bool {
        self.inner.state.read().generation_registered
    }

    /// Polls until a channel opens, `timeout` elapses or the client is closed.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), P2pError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(P2pError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(P2pError::Timeout(timeout));
            }
            tokio::time::sleep(CONNECTION_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Resolves once the current generation reaches `app_registered`. Fails
    /// with [`P2pError::NotConnected`] if its signaling connection ends first,
    /// which is also how a rejected API key shows up here.
    pub async fn wait_for_registration(&self) -> Result<(), P2pError> {
        let (generation, signaling) = {
            let state = self.inner.state.read();
            (state.generation, state.signaling.clone())
        };
        let Some(signaling) = signaling else {
            return Err(P2pError::NotConnected);
        };
        let mut registered = self.inner.registered_generation.subscribe();
        tokio::select! {
            biased;
            result = registered.wait_for(|registered| *registered == Some(generation)) => {
                result.map(|_| ()).map_err(|_| P2pError::Cancelled)
            }
            _ = signaling.closed() => Err(P2pError::NotConnected),
        }
    }

    /// Resolves when the current generation's signaling connection ends.
    /// Returns immediately if there is none.
    pub async fn disconnected(&self) {
        let signaling = self.inner.state.read().signaling.clone();
        if let Some(signaling) = signaling {
            signaling.closed().await;
        }
    }

    pub fn connection_state(&self) -> Option<PeerState> {
        self.inner
            .state
            .read()
            .peer
            .as_ref()
            .map(|peer| peer.session.connection_state())
    }

    pub async fn send_message(&self, data: Bytes) -> Result<(), P2pError> {
        let session = self.inner.state.read().current_session();
        match session {
            Some(session) => session.send(data).await,
            None => Err(P2pError::ChannelNotOpen),
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<(), P2pError> {
        let session = self.inner.state.read().current_session();
        match session {
            Some(session) => session.send_text(text.to_string()).await,
            None => Err(P2pError::ChannelNotOpen),
        }
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), P2pError> {
        let text = serde_json::to_string(value)?;
        self.send_text(&text).await
    }
}

/// Peer session, then transport, then the generation token.
async fn retire(retired: Retired) {
    if let Some(peer) = retired.peer {
        peer.session.close().await;
    }
    if let Some(signaling) = retired.signaling {
        signaling.close();
    }
    if let Some(cancel) = retired.cancel {
        cancel.cancel();
    }
}

impl ClientInner {
    fn is_current(&self, generation: u64) -> bool {
        self.state.read().generation == generation
    }

    fn emit_error(&self, error: &P2pError) {
        self.handler.on_p2p_error(error);
    }

    /// Closes the current peer session, if any, and installs a new one.
    async fn replace_peer(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Arc<dyn PeerSession>, P2pError> {
        let (seq, sink, previous, channel_lost) = {
            let mut state = self.state.write();
            if state.generation != generation {
                return Err(P2pError::Cancelled);
            }
            let sink = state.sink.clone().ok_or(P2pError::NotConnected)?;
            state.peer_seq += 1;
            let previous = state.peer.take();
            let channel_lost = previous.is_some() && std::mem::replace(&mut state.connected, false);
            (state.peer_seq, sink, previous, channel_lost)
        };
        if let Some(previous) = previous {
            tracing::debug!(
                target = "peerlink::client",
                generation,
                peer = %previous.session.id(),
                "closing previous peer session"
            );
            previous.session.close().await;
            if channel_lost {
                self.report_channel_lost(previous.session.id());
            }
        }

        let events = Arc::new(ChannelAdapter {
            client: Arc::downgrade(self),
            generation,
            peer_seq: seq,
        });
        let session = self.factory.create(sink, events).await?;

        let installed = {
            let mut state = self.state.write();
            if state.generation == generation {
                state.peer = Some(CurrentPeer {
                    seq,
                    session: Arc::clone(&session),
                });
                true
            } else {
                false
            }
        };
        if !installed {
            session.close().await;
            return Err(P2pError::Cancelled);
        }
        tracing::info!(
            target = "peerlink::client",
            generation,
            peer = %session.id(),
            "peer session created"
        );
        Ok(session)
    }

    /// Drops `session` from the state if it is still the current one.
    async fn discard_peer(&self, session: &Arc<dyn PeerSession>) {
        let removed = {
            let mut state = self.state.write();
            match &state.peer {
                Some(current) if Arc::ptr_eq(&current.session, session) => {
                    let channel_lost = std::mem::replace(&mut state.connected, false);
                    state.peer.take().map(|peer| (peer, channel_lost))
                }
                _ => None,
            }
        };
        if let Some((peer, channel_lost)) = removed {
            peer.session.close().await;
            if channel_lost {
                self.report_channel_lost(peer.session.id());
            }
        }
    }

    /// The channel of a session closed by the orchestrator never reports its
    /// own close, so the application hears about it here.
    fn report_channel_lost(&self, peer: &str) {
        tracing::info!(
            target = "peerlink::client",
            %peer,
            "p2p channel closed with its peer session"
        );
        self.handler.on_p2p_disconnected();
    }
}

/// Reuse a healthy session for a new offer. `Connecting` counts as dead: a
/// second offer mid-negotiation means the remote side gave up on the first.
fn reusable(state: PeerState) -> bool {
    matches!(
        state,
        PeerState::New | PeerState::Connected | PeerState::Disconnected
    )
}

struct SignalingAdapter {
    client: Weak<ClientInner>,
    generation: u64,
}

impl SignalingAdapter {
    fn current(&self, event: &'static str) -> Option<Arc<ClientInner>> {
        let client = self.client.upgrade()?;
        if client.is_current(self.generation) {
            Some(client)
        } else {
            tracing::debug!(
                target = "peerlink::client",
                generation = self.generation,
                event,
                "dropping event from stale generation"
            );
            None
        }
    }
}

#[async_trait]
impl SignalingHandler for SignalingAdapter {
    async fn on_connected(&self) {
        if self.current("connected").is_some() {
            tracing::debug!(
                target = "peerlink::client",
                generation = self.generation,
                "signaling connected"
            );
        }
    }

    async fn on_authenticated(&self, payload: AuthOkPayload) {
        if self.current("authenticated").is_some() {
            tracing::info!(
                target = "peerlink::client",
                generation = self.generation,
                user_id = %payload.user_id,
                "authenticated"
            );
        }
    }

    async fn on_auth_error(&self, payload: AuthErrorPayload) {
        let Some(client) = self.current("auth_error") else {
            return;
        };
        client.emit_error(&P2pError::Auth(payload.error));
        // A rejected key ends the generation; the supervisor decides when to retry.
        let signaling = client.state.read().signaling.clone();
        if let Some(signaling) = signaling {
            tracing::info!(
                target = "peerlink::client",
                generation = self.generation,
                "closing signaling connection after auth rejection"
            );
            signaling.close();
        }
    }

    async fn on_app_registered(&self, payload: AppRegisteredPayload) {
        let Some(client) = self.current("app_registered") else {
            return;
        };
        {
            let mut state = client.state.write();
            state.registered = true;
            state.generation_registered = true;
        }
        client.registered_generation.send_replace(Some(self.generation));
        tracing::info!(
            target = "peerlink::client",
            generation = self.generation,
            app_id = %payload.app_id,
            "registered with relay"
        );
        if let Err(err) = client.replace_peer(self.generation).await {
            tracing::warn!(
                target = "peerlink::client",
                generation = self.generation,
                error = %err,
                "failed to create peer session"
            );
            client.emit_error(&err);
        }
    }

    async fn on_offer(&self, sdp: String, request_id: String) {
        let Some(client) = self.current("offer") else {
            return;
        };
        tracing::info!(
            target = "peerlink::client",
            generation = self.generation,
            request_id = %request_id,
            "received offer"
        );

        let existing = client.state.read().current_session();
        let session = match existing {
            Some(session) if reusable(session.connection_state()) => session,
            existing => {
                if let Some(stale) = &existing {
                    tracing::info!(
                        target = "peerlink::client",
                        generation = self.generation,
                        peer = %stale.id(),
                        state = %stale.connection_state(),
                        "replacing peer session for new offer"
                    );
                }
                match client.replace_peer(self.generation).await {
                    Ok(session) => session,
                    Err(P2pError::Cancelled) => return,
                    Err(err) => {
                        tracing::warn!(
                            target = "peerlink::client",
                            generation = self.generation,
                            error = %err,
                            "failed to create peer session"
                        );
                        client.emit_error(&err);
                        return;
                    }
                }
            }
        };

        if let Err(err) = session.handle_offer(&sdp, &request_id).await {
            tracing::warn!(
                target = "peerlink::client",
                generation = self.generation,
                request_id = %request_id,
                error = %err,
                "offer handling failed; discarding peer session"
            );
            client.discard_peer(&session).await;
            client.emit_error(&err);
        }
    }

    async fn on_answer(&self, _sdp: String, app_id: Option<String>) {
        if self.current("answer").is_some() {
            tracing::warn!(
                target = "peerlink::client",
                generation = self.generation,
                app_id = ?app_id,
                "ignoring unexpected answer"
            );
        }
    }

    async fn on_ice(&self, candidate: Value) {
        let Some(client) = self.current("ice") else {
            return;
        };
        let Some(session) = client.state.read().current_session() else {
            tracing::debug!(
                target = "peerlink::client",
                generation = self.generation,
                "no peer session for remote candidate"
            );
            return;
        };
        if let Err(err) = session.add_ice_candidate(candidate).await {
            tracing::warn!(
                target = "peerlink::client",
                generation = self.generation,
                peer = %session.id(),
                error = %err,
                "failed to add remote candidate"
            );
        }
    }

    async fn on_error(&self, message: String) {
        let Some(client) = self.current("error") else {
            return;
        };
        tracing::warn!(
            target = "peerlink::client",
            generation = self.generation,
            message = %message,
            "signaling error"
        );
        client.emit_error(&P2pError::Signaling(message));
    }

    async fn on_disconnected(&self) {
        let Some(client) = self.current("disconnected") else {
            return;
        };
        {
            let mut state = client.state.write();
            state.connected = false;
            state.registered = false;
        }
        tracing::info!(
            target = "peerlink::client",
            generation = self.generation,
            "signaling connection lost"
        );
        client.handler.on_p2p_disconnected();
    }
}

struct ChannelAdapter {
    client: Weak<ClientInner>,
    generation: u64,
    peer_seq: u64,
}

impl ChannelAdapter {
    fn current(&self, event: &'static str) -> Option<Arc<ClientInner>> {
        let client = self.client.upgrade()?;
        let live = {
            let state = client.state.read();
            state.generation == self.generation
                && state.peer.as_ref().map(|peer| peer.seq) == Some(self.peer_seq)
        };
        if live {
            Some(client)
        } else {
            tracing::debug!(
                target = "peerlink::client",
                generation = self.generation,
                peer_seq = self.peer_seq,
                event,
                "dropping event from stale peer session"
            );
            None
        }
    }
}

impl ChannelEvents for ChannelAdapter {
    fn on_open(&self, channel: Arc<dyn ByteChannel>) {
        let Some(client) = self.current("channel_open") else {
            return;
        };
        client.state.write().connected = true;
        tracing::info!(
            target = "peerlink::client",
            generation = self.generation,
            label = %channel.label(),
            "p2p channel ready"
        );
        if let Some(hook) = &client.channel_ready {
            hook(channel);
        }
        client.handler.on_p2p_connected();
    }

    fn on_close(&self) {
        let Some(client) = self.current("channel_close") else {
            return;
        };
        let was_connected = std::mem::replace(&mut client.state.write().connected, false);
        if was_connected {
            tracing::info!(
                target = "peerlink::client",
                generation = self.generation,
                "p2p channel closed"
            );
            client.handler.on_p2p_disconnected();
        }
    }

    fn on_message(&self, data: Bytes) {
        if let Some(client) = self.current("channel_message") {
            client.handler.on_p2p_message(data);
        }
    }
}
