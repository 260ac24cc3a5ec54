// THEORY:
// Both network sources (the MJPEG stream and the notification socket) follow the
// same discipline: connect, serve until something breaks, wait a moment, connect
// again, forever. This module owns that discipline so that each source only has
// to describe what a single connection attempt does.
//
// Key architectural principles:
// 1.  **Separation of policy and attempt**: `run_with_reconnect` knows nothing
//     about HTTP or websockets. It re-invokes an attempt future until cancelled.
// 2.  **No giving up**: There is no retry limit. An unattended kiosk has nobody to
//     press "retry", so every failure is logged and followed by another attempt.
// 3.  **Cancellation at every suspension point**: Both the backoff sleep and the
//     attempt itself race against the cancellation token.
// 4.  **Observable state**: The current `ConnectionState` is published on a watch
//     channel. The attempt reports `Connected` itself once its handshake succeeds.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Connection status of one network source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Pause before every attempt except the first.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// What a connection attempt that ended without error asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The peer ended the connection; connect again.
    Reconnect,
    /// Nobody consumes the output anymore; stop the source.
    Stop,
}

/// Runs `attempt` over and over until cancellation or an `AttemptOutcome::Stop`.
pub async fn run_with_reconnect<F, Fut, E>(
    source: &str,
    target: &str,
    policy: ReconnectPolicy,
    cancel: &CancellationToken,
    state: &watch::Sender<ConnectionState>,
    mut attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<AttemptOutcome, E>>,
    E: Display,
{
    let mut first = true;
    while !cancel.is_cancelled() {
        if first {
            info!(source, "Connecting to {target}");
        } else {
            info!(source, "Reconnecting to {target}");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
        first = false;

        state.send_replace(ConnectionState::Connecting);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = attempt() => outcome,
        };
        state.send_replace(ConnectionState::Disconnected);

        match outcome {
            Ok(AttemptOutcome::Reconnect) => info!(source, "Connection to {target} closed"),
            Ok(AttemptOutcome::Stop) => break,
            Err(e) => error!(source, "Disconnected from {target}: {e}"),
        }
    }
    state.send_replace(ConnectionState::Disconnected);
    info!(source, "Stopped");
}
