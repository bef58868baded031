//! Persistent websocket connection to the signaling relay.
//!
//! The transport owns authentication and keep-alive and turns inbound frames
//! into [`SignalingHandler`] calls. It knows nothing about WebRTC; the SDP and
//! ICE payloads it carries are opaque strings and JSON values.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ClientConfig;
use crate::error::P2pError;
use crate::guard::guard_future;
use crate::peer::SignalSink;
use crate::protocol::{
    AnswerPayload, AppRegisterPayload, AppRegisteredPayload, AuthErrorPayload, AuthOkPayload,
    AuthPayload, Envelope, IcePayload, Message,
};

const API_KEY_PARAM: &str = "apiKey";

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub server_url: String,
    pub api_key: String,
    pub app_name: String,
    pub capabilities: Vec<String>,
    pub ping_interval: Duration,
}

impl From<&ClientConfig> for SignalingConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            server_url: config.signaling_url.clone(),
            api_key: config.api_key.clone(),
            app_name: config.app_name.clone(),
            capabilities: config.capabilities.clone(),
            ping_interval: config.ping_interval,
        }
    }
}

/// Receives relay events. Calls arrive one at a time from the read loop in
/// frame order, so a slow handler stalls every later frame.
#[async_trait]
pub trait SignalingHandler: Send + Sync {
    async fn on_connected(&self) {}
    async fn on_authenticated(&self, _payload: AuthOkPayload) {}
    async fn on_auth_error(&self, _payload: AuthErrorPayload) {}
    async fn on_app_registered(&self, _payload: AppRegisteredPayload) {}
    async fn on_offer(&self, _sdp: String, _request_id: String) {}
    /// Answers are only addressed to browsers; an app receiving one is a relay quirk.
    async fn on_answer(&self, _sdp: String, _app_id: Option<String>) {}
    async fn on_ice(&self, _candidate: Value) {}
    async fn on_error(&self, _message: String) {}
    async fn on_disconnected(&self) {}
}

#[derive(Default)]
struct LinkState {
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    connected: bool,
    authenticated: bool,
    app_id: Option<String>,
}

pub struct SignalingTransport {
    config: SignalingConfig,
    handler: Arc<dyn SignalingHandler>,
    state: RwLock<LinkState>,
    cancel: CancellationToken,
    disconnect_fired: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingTransport {
    /// Builds an unconnected transport whose background work stops when
    /// `parent` is cancelled.
    pub fn new(
        config: SignalingConfig,
        handler: Arc<dyn SignalingHandler>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            state: RwLock::new(LinkState::default()),
            cancel: parent.child_token(),
            disconnect_fired: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Dials the relay and sends `auth`. Returns without waiting for
    /// `auth_ok`; the outcome arrives through the handler.
    pub async fn connect(self: &Arc<Self>) -> Result<(), P2pError> {
        if self.state.read().connected {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(P2pError::Cancelled);
        }

        let url = relay_url(&self.config.server_url, &self.config.api_key)?;
        tracing::debug!(
            target = "peerlink::signaling",
            server = %self.config.server_url,
            "dialing signaling relay"
        );
        let dial = tokio::select! {
            _ = self.cancel.cancelled() => return Err(P2pError::Cancelled),
            result = connect_async(url.as_str()) => result,
        };
        let (ws_stream, _) =
            dial.map_err(|err| P2pError::Connect(format!("websocket dial failed: {err}")))?;
        let (mut ws_write, ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        {
            let mut state = self.state.write();
            state.outbound = Some(outbound_tx);
            state.connected = true;
            state.authenticated = false;
        }
        tracing::info!(
            target = "peerlink::signaling",
            server = %self.config.server_url,
            "signaling websocket connected"
        );

        // Exits on its own once every sender is gone, after flushing the close frame.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(err) = ws_write.send(frame).await {
                    tracing::debug!(
                        target = "peerlink::signaling",
                        error = %err,
                        "signaling write failed"
                    );
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        guard_future("connected", self.handler.on_connected()).await;

        let reader = tokio::spawn(Arc::clone(self).read_loop(ws_read));
        let pinger = tokio::spawn(Arc::clone(self).ping_loop());
        self.tasks.lock().extend([reader, pinger]);

        let auth = Message::Auth(AuthPayload {
            api_key: self.config.api_key.clone(),
        });
        if let Err(err) = self.send(&auth, "") {
            self.close();
            return Err(P2pError::Connect(format!("auth send failed: {err}")));
        }
        tracing::debug!(target = "peerlink::signaling", "sent auth message");
        Ok(())
    }

    /// Sends `app_register` with the configured name and capability set.
    pub fn register_app(&self) -> Result<(), P2pError> {
        let message = Message::AppRegister(AppRegisterPayload {
            name: self.config.app_name.clone(),
            capabilities: self.config.capabilities.clone(),
        });
        self.send(&message, "")
    }

    /// Connected and authenticated.
    pub fn is_connected(&self) -> bool {
        let state = self.state.read();
        state.connected && state.authenticated
    }

    pub fn app_id(&self) -> Option<String> {
        self.state.read().app_id.clone()
    }

    /// Resolves once the connection has ended for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Sends a normal-closure frame if the connection is live and stops all
    /// background work. Safe to call repeatedly.
    pub fn close(&self) {
        let outbound = {
            let mut state = self.state.write();
            state.connected = false;
            state.authenticated = false;
            state.outbound.take()
        };
        if let Some(outbound) = outbound {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let _ = outbound.send(WsMessage::Close(Some(frame)));
            tracing::debug!(target = "peerlink::signaling", "closing signaling connection");
        }
        self.cancel.cancel();
    }

    fn send(&self, message: &Message, request_id: &str) -> Result<(), P2pError> {
        let text = Envelope::new(message, request_id)?.to_text()?;
        let state = self.state.read();
        let outbound = match (&state.outbound, state.connected) {
            (Some(outbound), true) => outbound,
            _ => return Err(P2pError::NotConnected),
        };
        outbound
            .send(WsMessage::Text(text))
            .map_err(|_| P2pError::NotConnected)?;
        tracing::trace!(
            target = "peerlink::signaling",
            event = "ws_out",
            kind = message.kind(),
            request_id,
        );
        Ok(())
    }

    async fn read_loop<S>(self: Arc<Self>, mut stream: S)
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Unpin + Send + 'static,
    {
        let mut cancelled = false;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(target = "peerlink::signaling", "read loop cancelled");
                    cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::trace!(
                        target = "peerlink::signaling",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    self.handle_frame(&text).await;
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.handle_frame(&text).await,
                    Err(_) => {
                        guard_future(
                            "error",
                            self.handler
                                .on_error("binary signaling frame is not utf-8".into()),
                        )
                        .await;
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(
                        target = "peerlink::signaling",
                        frame = ?frame,
                        "relay closed signaling websocket"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(
                                target = "peerlink::signaling",
                                "signaling websocket closed: {err}"
                            );
                        }
                        _ => {
                            tracing::warn!(
                                target = "peerlink::signaling",
                                "signaling websocket error: {err}"
                            );
                            guard_future(
                                "error",
                                self.handler.on_error(format!("websocket error: {err}")),
                            )
                            .await;
                        }
                    }
                    break;
                }
                None => break,
            }
        }

        {
            let mut state = self.state.write();
            state.connected = false;
            state.authenticated = false;
            state.outbound = None;
        }
        // An explicit close is not a disconnect.
        if !cancelled && !self.disconnect_fired.swap(true, Ordering::SeqCst) {
            tracing::info!(target = "peerlink::signaling", "signaling disconnected");
            guard_future("disconnected", self.handler.on_disconnected()).await;
        }
        self.cancel.cancel();
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sent = {
                let state = self.state.read();
                state
                    .outbound
                    .as_ref()
                    .map(|outbound| outbound.send(WsMessage::Ping(Vec::new())).is_ok())
            };
            match sent {
                Some(true) => {
                    tracing::trace!(target = "peerlink::signaling", event = "ws_ping");
                }
                _ => break,
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    target = "peerlink::signaling",
                    error = %err,
                    "dropping malformed signaling frame"
                );
                guard_future(
                    "error",
                    self.handler.on_error(format!("invalid message format: {err}")),
                )
                .await;
                return;
            }
        };
        let message = match envelope.decode() {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(
                    target = "peerlink::signaling",
                    kind = %envelope.kind,
                    "ignoring unknown message type"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    target = "peerlink::signaling",
                    kind = %envelope.kind,
                    error = %err,
                    "dropping frame with malformed payload"
                );
                guard_future(
                    "error",
                    self.handler
                        .on_error(format!("invalid {} payload: {err}", envelope.kind)),
                )
                .await;
                return;
            }
        };

        match message {
            Message::AuthOk(payload) => {
                self.state.write().authenticated = true;
                tracing::info!(
                    target = "peerlink::signaling",
                    user_id = %payload.user_id,
                    account_type = %payload.account_type,
                    "authenticated with relay"
                );
                if let Err(err) = self.register_app() {
                    tracing::warn!(
                        target = "peerlink::signaling",
                        error = %err,
                        "failed to send app registration"
                    );
                }
                guard_future("authenticated", self.handler.on_authenticated(payload)).await;
            }
            Message::AuthError(payload) => {
                tracing::warn!(
                    target = "peerlink::signaling",
                    error = %payload.error,
                    "relay rejected credentials"
                );
                guard_future("auth_error", self.handler.on_auth_error(payload)).await;
            }
            Message::AppRegistered(payload) => {
                self.state.write().app_id = Some(payload.app_id.clone());
                tracing::info!(
                    target = "peerlink::signaling",
                    app_id = %payload.app_id,
                    "app registered"
                );
                guard_future("app_registered", self.handler.on_app_registered(payload)).await;
            }
            Message::Offer(payload) => {
                guard_future(
                    "offer",
                    self.handler.on_offer(payload.sdp, envelope.request_id),
                )
                .await;
            }
            Message::Answer(payload) => {
                guard_future("answer", self.handler.on_answer(payload.sdp, payload.app_id)).await;
            }
            Message::Ice(payload) => {
                guard_future("ice", self.handler.on_ice(payload.candidate)).await;
            }
            Message::Error(payload) => {
                guard_future("error", self.handler.on_error(payload.message)).await;
            }
            Message::Auth(_) | Message::AppRegister(_) => {
                tracing::debug!(
                    target = "peerlink::signaling",
                    kind = %envelope.kind,
                    "ignoring relay-bound message type"
                );
            }
        }
    }
}

impl SignalSink for SignalingTransport {
    fn send_answer(&self, sdp: &str, request_id: &str) -> Result<(), P2pError> {
        let message = Message::Answer(AnswerPayload {
            sdp: sdp.to_string(),
            app_id: None,
        });
        self.send(&message, request_id)
    }

    fn send_ice(&self, candidate: Value) -> Result<(), P2pError> {
        self.send(&Message::Ice(IcePayload { candidate }), "")
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Adds the API key as a query parameter, replacing any key already present.
/// `http(s)` URLs are mapped onto `ws(s)`.
pub fn relay_url(server_url: &str, api_key: &str) -> Result<Url, P2pError> {
    let mut url = Url::parse(server_url)
        .map_err(|err| P2pError::Connect(format!("invalid server url {server_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(P2pError::Connect(format!(
                "unsupported signaling url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| P2pError::Connect("invalid websocket scheme".into()))?;

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != API_KEY_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(API_KEY_PARAM, api_key);
    }
    Ok(url)
}
