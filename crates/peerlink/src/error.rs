use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    /// Malformed relay URL or the websocket dial failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The relay rejected the API key.
    #[error("auth error: {0}")]
    Auth(String),
    /// The remote offer could not be applied or answered.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("signaling transport is not connected")]
    NotConnected,
    /// An `error` frame sent by the relay.
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("peer connection setup failed: {0}")]
    PeerSetup(String),
    #[error("data channel write failed: {0}")]
    Channel(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl P2pError {
    /// Errors that end the current signaling generation and hand control to
    /// the reconnect loop.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            P2pError::Connect(_) | P2pError::Timeout(_) | P2pError::NotConnected
        )
    }
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> P2pError {
    P2pError::Negotiation(err.to_string())
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> P2pError {
    P2pError::PeerSetup(err.to_string())
}
