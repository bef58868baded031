use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::P2pError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// One STUN/TURN entry handed to the peer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.credential = credential.into();
        self
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::new(DEFAULT_STUN_SERVER)]
}

/// Converts the configured list, falling back to the public STUN server when
/// nothing was supplied.
pub fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    if servers.is_empty() {
        default_ice_servers().iter().map(RTCIceServer::from).collect()
    } else {
        servers.iter().map(RTCIceServer::from).collect()
    }
}

/// Everything the orchestrator needs before `connect` is called.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket URL of the relay, e.g. `wss://relay.example.com/ws/app`.
    pub signaling_url: String,
    pub api_key: String,
    pub app_name: String,
    pub capabilities: Vec<String>,
    pub ice_servers: Vec<IceServer>,
    /// Interval between websocket pings on the signaling connection.
    pub ping_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        signaling_url: impl Into<String>,
        api_key: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            api_key: api_key.into(),
            app_name: app_name.into(),
            capabilities: Vec::new(),
            ice_servers: default_ice_servers(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), P2pError> {
        if self.signaling_url.trim().is_empty() {
            return Err(P2pError::Connect("signaling url is empty".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(P2pError::Connect("api key is empty".into()));
        }
        if self.app_name.trim().is_empty() {
            return Err(P2pError::Connect("app name is empty".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(P2pError::Connect("ping interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_public_stun() {
        let config = ClientConfig::new("wss://relay/ws/app", "key", "agent");
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
        assert_eq!(config.ping_interval, Duration::from_secs(30));

        let converted = rtc_ice_servers(&[]);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn turn_credentials_survive_conversion() {
        let server = IceServer::new("turn:turn.example.com:3478").with_credentials("u", "p");
        let converted = rtc_ice_servers(std::slice::from_ref(&server));
        assert_eq!(converted[0].username, "u");
        assert_eq!(converted[0].credential, "p");
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(ClientConfig::new("", "key", "agent").validate().is_err());
        assert!(ClientConfig::new("wss://relay", " ", "agent").validate().is_err());
        assert!(ClientConfig::new("wss://relay", "key", "").validate().is_err());
        assert!(
            ClientConfig::new("wss://relay", "key", "agent")
                .with_capabilities(["scrape"])
                .validate()
                .is_ok()
        );
    }
}
