use std::sync::Arc;

use bytes::Bytes;
use peerlink::{ByteChannel, ClientEventHandler, P2pError};

/// Logs application-level channel events. Requests carried over the channel
/// are served by whatever the channel-ready hook binds to it.
pub struct LoggingHandler;

impl ClientEventHandler for LoggingHandler {
    fn on_p2p_connected(&self) {
        tracing::info!(target = "peerlink_agent", "browser connected over webrtc");
    }

    fn on_p2p_disconnected(&self) {
        tracing::info!(target = "peerlink_agent", "browser disconnected");
    }

    fn on_p2p_message(&self, data: Bytes) {
        tracing::debug!(
            target = "peerlink_agent",
            len = data.len(),
            "received channel message"
        );
    }

    fn on_p2p_error(&self, error: &P2pError) {
        tracing::warn!(target = "peerlink_agent", error = %error, "p2p error");
    }
}

pub fn channel_ready(channel: Arc<dyn ByteChannel>) {
    tracing::info!(
        target = "peerlink_agent",
        label = %channel.label(),
        "data channel ready for requests"
    );
}
