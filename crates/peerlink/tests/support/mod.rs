#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process stand-in for the signaling relay. Every accepted websocket is
/// handed to the test as a [`RelayConnection`].
pub struct FakeRelay {
    pub addr: SocketAddr,
    pub url: String,
    connections: mpsc::UnboundedReceiver<RelayConnection>,
    shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub enum Frame {
    Text(Value),
    Ping,
    Close,
}

enum Command {
    Send(String),
    Drop,
}

pub struct RelayConnection {
    pub query: HashMap<String, String>,
    frames: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::UnboundedSender<Command>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let router = Router::new()
            .route("/ws/app", get(ws_handler))
            .with_state(conn_tx);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            addr,
            url: format!("ws://{addr}/ws/app"),
            connections: conn_rx,
            shutdown: Some(shutdown_tx),
        }
    }

    pub async fn accept(&mut self) -> RelayConnection {
        timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("relay accept timed out")
            .expect("relay stopped")
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl RelayConnection {
    pub async fn next_frame(&mut self) -> Frame {
        timeout(STEP_TIMEOUT, self.frames.recv())
            .await
            .expect("no frame from client")
            .expect("relay connection ended")
    }

    /// Next JSON message, skipping pings.
    pub async fn expect_message(&mut self) -> Value {
        loop {
            match self.next_frame().await {
                Frame::Text(value) => return value,
                Frame::Ping => continue,
                Frame::Close => panic!("client closed while a message was expected"),
            }
        }
    }

    pub async fn expect_close(&mut self) {
        loop {
            match self.next_frame().await {
                Frame::Close => return,
                Frame::Ping => continue,
                Frame::Text(value) => panic!("expected close, got {value}"),
            }
        }
    }

    pub fn send(&self, value: Value) {
        self.send_raw(value.to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Send(text.into()));
    }

    /// Drops the socket without a closing handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(Command::Drop);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(connections): State<mpsc::UnboundedSender<RelayConnection>>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, connections))
}

async fn handle_socket(
    socket: WebSocket,
    query: HashMap<String, String>,
    connections: mpsc::UnboundedSender<RelayConnection>,
) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    if connections
        .send(RelayConnection {
            query,
            frames: frame_rx,
            commands: command_tx,
        })
        .is_err()
    {
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(Command::Send(text)) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Drop) | None => break,
            },
            message = receiver.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    let _ = frame_tx.send(Frame::Text(value));
                }
                Some(Ok(WsMessage::Ping(_))) => {
                    let _ = frame_tx.send(Frame::Ping);
                }
                Some(Ok(WsMessage::Close(_))) => {
                    let _ = frame_tx.send(Frame::Close);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}
