use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use peerlink::IceServer;

use crate::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "peerlink-agent")]
#[command(about = "Keeps a WebRTC data channel reachable through a signaling relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "PEERLINK_LOG_LEVEL", global = true)]
    pub log_level: LogLevel,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "PEERLINK_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a credentials file for later runs
    Credentials(CredentialsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Relay websocket endpoint, e.g. wss://relay.example.com/ws/app
    #[arg(long, env = "PEERLINK_SIGNALING_URL")]
    pub signaling_url: Option<String>,

    /// API key; falls back to the credentials file when unset
    #[arg(long, env = "PEERLINK_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "PEERLINK_APP_NAME", default_value = "peerlink-agent")]
    pub app_name: String,

    #[arg(
        long,
        env = "PEERLINK_CAPABILITIES",
        value_delimiter = ',',
        default_value = "scrape,etc"
    )]
    pub capabilities: Vec<String>,

    /// STUN/TURN urls; `turn:user:pass@host:port` carries credentials
    #[arg(long = "ice-server", env = "PEERLINK_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Credentials file checked before the default locations
    #[arg(long, env = "PEERLINK_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Seconds between websocket pings
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,
}

#[derive(Args, Debug)]
pub struct CredentialsArgs {
    #[arg(long)]
    pub api_key: String,

    #[arg(long)]
    pub app_id: Option<String>,

    /// Defaults to ~/.peerlink/p2p_credentials.env
    #[arg(long)]
    pub path: Option<PathBuf>,
}

impl RunArgs {
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(parse_ice_server)
            .collect()
    }
}

/// `scheme:host:port` or `scheme:user:pass@host:port`.
pub fn parse_ice_server(raw: &str) -> IceServer {
    let Some((scheme, rest)) = raw.split_once(':') else {
        return IceServer::new(raw);
    };
    match rest.rsplit_once('@') {
        Some((auth, host)) => match auth.split_once(':') {
            Some((username, credential)) => {
                IceServer::new(format!("{scheme}:{host}")).with_credentials(username, credential)
            }
            None => IceServer::new(raw),
        },
        None => IceServer::new(raw),
    }
}
