//! Reconnect loop that keeps a [`P2pClient`] attached to the relay.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::client::P2pClient;
use crate::error::P2pError;
use crate::guard::panic_message;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on one attempt, from dialing until `app_registered`.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the retry following the `failures`-th consecutive failure:
    /// `min(initial * 2^(failures - 1), max)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Connects, waits for registration and then for the connection to drop,
/// backs off and repeats until `shutdown` is cancelled. Never gives up on its
/// own. The client is closed before returning.
pub async fn run(client: &P2pClient, policy: ReconnectPolicy, shutdown: CancellationToken) {
    let mut backoff = Backoff::new(policy);
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let attempt = AssertUnwindSafe(tokio::time::timeout(
            policy.connect_timeout,
            establish(client, &shutdown),
        ))
        .catch_unwind();
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(Ok(()))) => {
                tracing::info!(
                    target = "peerlink::supervisor",
                    "signaling session established"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = client.disconnected() => {}
                }
                if client.generation_registered() {
                    backoff.reset();
                }
                tracing::info!(target = "peerlink::supervisor", "signaling session ended");
            }
            Ok(Ok(Err(P2pError::Cancelled))) if shutdown.is_cancelled() => break,
            Ok(Ok(Err(err))) => {
                log_failure(&err);
                client.close().await;
            }
            Ok(Err(_elapsed)) => {
                log_failure(&P2pError::Timeout(policy.connect_timeout));
                client.close().await;
            }
            Err(payload) => {
                tracing::error!(
                    target = "peerlink::supervisor",
                    panic = %panic_message(payload.as_ref()),
                    "connect attempt panicked"
                );
            }
        }

        let delay = backoff.next_delay();
        tracing::info!(
            target = "peerlink::supervisor",
            attempt = backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting after backoff"
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(target = "peerlink::supervisor", "shutting down p2p client");
    client.close().await;
}

async fn establish(client: &P2pClient, shutdown: &CancellationToken) -> Result<(), P2pError> {
    client.connect(shutdown).await?;
    client.wait_for_registration().await
}

fn log_failure(err: &P2pError) {
    if err.is_connection_failure() {
        tracing::warn!(target = "peerlink::supervisor", error = %err, "connect attempt failed");
    } else {
        tracing::error!(target = "peerlink::supervisor", error = %err, "connect attempt failed");
    }
}
