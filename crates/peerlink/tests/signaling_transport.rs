mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink::P2pError;
use peerlink::peer::SignalSink;
use peerlink::protocol::{AppRegisteredPayload, AuthErrorPayload, AuthOkPayload};
use peerlink::signaling::{SignalingConfig, SignalingHandler, SignalingTransport};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use support::{FakeRelay, Frame, STEP_TIMEOUT};

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Authenticated(String),
    AuthError(String),
    AppRegistered(String),
    Offer(String, String),
    Ice(Value),
    Error(String),
    Disconnected,
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl SignalingHandler for Recorder {
    async fn on_connected(&self) {
        let _ = self.events.send(Event::Connected);
    }

    async fn on_authenticated(&self, payload: AuthOkPayload) {
        let _ = self.events.send(Event::Authenticated(payload.user_id));
    }

    async fn on_auth_error(&self, payload: AuthErrorPayload) {
        let _ = self.events.send(Event::AuthError(payload.error));
    }

    async fn on_app_registered(&self, payload: AppRegisteredPayload) {
        let _ = self.events.send(Event::AppRegistered(payload.app_id));
    }

    async fn on_offer(&self, sdp: String, request_id: String) {
        let _ = self.events.send(Event::Offer(sdp, request_id));
    }

    async fn on_ice(&self, candidate: Value) {
        let _ = self.events.send(Event::Ice(candidate));
    }

    async fn on_error(&self, message: String) {
        let _ = self.events.send(Event::Error(message));
    }

    async fn on_disconnected(&self) {
        let _ = self.events.send(Event::Disconnected);
    }
}

fn config(url: &str) -> SignalingConfig {
    SignalingConfig {
        server_url: url.to_string(),
        api_key: "test-key".into(),
        app_name: "agent".into(),
        capabilities: vec!["scrape".into(), "etc".into()],
        ping_interval: Duration::from_secs(30),
    }
}

fn transport(config: SignalingConfig) -> (Arc<SignalingTransport>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = SignalingTransport::new(
        config,
        Arc::new(Recorder { events: tx }),
        &CancellationToken::new(),
    );
    (transport, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("no signaling event")
        .expect("event channel closed")
}

#[test_timeout::tokio_timeout_test]
async fn authenticates_then_registers_app() {
    let mut relay = FakeRelay::start().await;
    let (transport, mut events) = transport(config(&relay.url));
    transport.connect().await.expect("connect");
    let mut conn = relay.accept().await;

    assert_eq!(conn.query.get("apiKey").map(String::as_str), Some("test-key"));
    assert_eq!(next_event(&mut events).await, Event::Connected);
    assert_eq!(
        conn.expect_message().await,
        json!({"type": "auth", "payload": {"apiKey": "test-key"}, "requestId": ""})
    );
    assert!(!transport.is_connected());

    conn.send(json!({"type": "auth_ok", "payload": {"userId": "u1", "type": "free"}}));
    assert_eq!(
        conn.expect_message().await,
        json!({
            "type": "app_register",
            "payload": {"name": "agent", "capabilities": ["scrape", "etc"]},
            "requestId": ""
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Authenticated("u1".into())
    );
    assert!(transport.is_connected());

    conn.send(json!({"type": "app_registered", "payload": {"appId": "app-42"}}));
    assert_eq!(
        next_event(&mut events).await,
        Event::AppRegistered("app-42".into())
    );
    assert_eq!(transport.app_id().as_deref(), Some("app-42"));

    conn.send(json!({"type": "offer", "payload": {"sdp": "v=0 offer"}, "requestId": "req-1"}));
    assert_eq!(
        next_event(&mut events).await,
        Event::Offer("v=0 offer".into(), "req-1".into())
    );

    transport.send_answer("v=0 answer", "req-1").expect("answer");
    assert_eq!(
        conn.expect_message().await,
        json!({"type": "answer", "payload": {"sdp": "v=0 answer"}, "requestId": "req-1"})
    );

    transport
        .send_ice(json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0"}))
        .expect("ice");
    let ice = conn.expect_message().await;
    assert_eq!(ice["type"], "ice");
    assert_eq!(ice["payload"]["candidate"]["sdpMid"], "0");

    transport.close();
    transport.close();
    conn.expect_close().await;
}

#[test_timeout::tokio_timeout_test]
async fn auth_error_and_relay_errors_reach_handler() {
    let mut relay = FakeRelay::start().await;
    let (transport, mut events) = transport(config(&relay.url));
    transport.connect().await.expect("connect");
    let mut conn = relay.accept().await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
    conn.expect_message().await;

    conn.send(json!({"type": "auth_error", "payload": {"error": "invalid api key"}}));
    conn.send(json!({"type": "error", "payload": {"message": "app limit reached"}}));
    assert_eq!(
        next_event(&mut events).await,
        Event::AuthError("invalid api key".into())
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Error("app limit reached".into())
    );
    assert!(!transport.is_connected());
    transport.close();
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_do_not_end_the_read_loop() {
    let mut relay = FakeRelay::start().await;
    let (transport, mut events) = transport(config(&relay.url));
    transport.connect().await.expect("connect");
    let mut conn = relay.accept().await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
    conn.expect_message().await;

    conn.send_raw("{this is not json");
    conn.send(json!({"type": "offer", "payload": {"sdp": 5}}));
    conn.send(json!({"type": "presence", "payload": {}}));
    conn.send(json!({"type": "ice", "payload": {"candidate": "candidate:2 1 udp 1 10.0.0.2 6000 typ host"}}));

    match next_event(&mut events).await {
        Event::Error(message) => assert!(message.contains("invalid message format")),
        other => panic!("expected error event, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Error(message) => assert!(message.contains("invalid offer payload"), "{message}"),
        other => panic!("expected payload error event, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        Event::Ice(json!("candidate:2 1 udp 1 10.0.0.2 6000 typ host"))
    );
    transport.close();
}

#[test_timeout::tokio_timeout_test]
async fn connection_reset_fires_disconnected_once() {
    let mut relay = FakeRelay::start().await;
    let (transport, mut events) = transport(config(&relay.url));
    transport.connect().await.expect("connect");
    let mut conn = relay.accept().await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
    conn.expect_message().await;

    conn.drop_connection();
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
    timeout(STEP_TIMEOUT, transport.closed())
        .await
        .expect("transport did not settle");

    assert!(!transport.is_connected());
    assert!(matches!(
        transport.send_answer("v=0", "late"),
        Err(P2pError::NotConnected)
    ));
    transport.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn keepalive_pings_are_sent() {
    let mut relay = FakeRelay::start().await;
    let mut config = config(&relay.url);
    config.ping_interval = Duration::from_millis(100);
    let (transport, _events) = transport(config);
    transport.connect().await.expect("connect");
    let mut conn = relay.accept().await;

    let mut pings = 0;
    while pings < 2 {
        if let Frame::Ping = conn.next_frame().await {
            pings += 1;
        }
    }
    transport.close();
}

#[test_timeout::tokio_timeout_test]
async fn dial_failures_are_connect_errors() {
    let (bad, _events) = transport(config("not a url"));
    assert!(matches!(bad.connect().await, Err(P2pError::Connect(_))));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let (unreachable, _events) = transport(config(&format!("ws://{addr}/ws/app")));
    assert!(matches!(
        unreachable.connect().await,
        Err(P2pError::Connect(_))
    ));
    assert!(!unreachable.is_connected());
}
