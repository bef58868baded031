mod cli;
mod handler;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use peerlink::credentials::{self, Credentials};
use peerlink::{ClientConfig, P2pClient, ReconnectPolicy, supervisor};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command, CredentialsArgs, RunArgs};
use crate::handler::{LoggingHandler, channel_ready};
use crate::logging::LogConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    match cli.command {
        Some(Command::Credentials(args)) => write_credentials(args),
        None => run(cli.run).await,
    }
}

fn write_credentials(args: CredentialsArgs) -> Result<()> {
    let path = match args.path {
        Some(path) => path,
        None => credentials::user_credentials_path()?,
    };
    let credentials = Credentials {
        api_key: args.api_key,
        app_id: args.app_id,
    };
    credentials
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(target = "peerlink_agent", path = %path.display(), "credentials saved");
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target = "peerlink_agent", "interrupt received, shutting down");
        }
        signal_token.cancel();
    });

    let Some(signaling_url) = args.signaling_url.clone() else {
        bail!("--signaling-url (or PEERLINK_SIGNALING_URL) is required");
    };

    let api_key = match args.api_key.clone().filter(|key| !key.trim().is_empty()) {
        Some(key) => key,
        None => match credentials::resolve(args.credentials.as_deref()) {
            Some((path, credentials)) => {
                tracing::info!(
                    target = "peerlink_agent",
                    path = %path.display(),
                    "loaded api key from credentials file"
                );
                credentials.api_key
            }
            None => {
                tracing::warn!(
                    target = "peerlink_agent",
                    searched = ?credentials::candidate_paths(args.credentials.as_deref()),
                    "no api key found; run `peerlink-agent credentials --api-key <KEY>` first"
                );
                tracing::info!(
                    target = "peerlink_agent",
                    "agent stays idle until shutdown"
                );
                shutdown.cancelled().await;
                return Ok(());
            }
        },
    };

    let mut config = ClientConfig::new(signaling_url, api_key, args.app_name.clone())
        .with_capabilities(args.capabilities.clone())
        .with_ping_interval(Duration::from_secs(args.ping_interval_secs.max(1)));
    let ice_servers = args.ice_servers();
    if !ice_servers.is_empty() {
        config = config.with_ice_servers(ice_servers);
    }
    config.validate()?;

    tracing::info!(
        target = "peerlink_agent",
        server = %config.signaling_url,
        app = %config.app_name,
        capabilities = ?config.capabilities,
        "starting p2p agent"
    );

    let client = P2pClient::builder(config)
        .handler(Arc::new(LoggingHandler))
        .on_channel_ready(channel_ready)
        .build();
    supervisor::run(&client, ReconnectPolicy::default(), shutdown).await;
    Ok(())
}
