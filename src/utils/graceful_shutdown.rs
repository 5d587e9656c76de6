use std::time::Duration;

use tokio::{signal, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code
    Requested,
}

/// Turns OS signals into cancellation of a shared token.
///
/// Background tasks (the rejection flush loop, the config watcher, the admin
/// server) all observe the same [`CancellationToken`].
pub struct GracefulShutdown {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new manager with a 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "Shutdown triggered");
            self.token.cancel();
        }
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    pub async fn run_signal_handler(&self) -> ShutdownReason {
        let reason = tokio::select! {
            _ = self.token.cancelled() => ShutdownReason::Requested,
            _ = signal::ctrl_c() => ShutdownReason::Interrupt,
            _ = wait_for_sigterm() => ShutdownReason::Terminate,
        };
        self.trigger_shutdown(reason);
        reason
    }

    /// Wait for a background task to finish, giving up after the drain timeout.
    pub async fn drain(&self, name: &str, handle: JoinHandle<()>) {
        match timeout(self.drain_timeout, handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "Background task stopped"),
            Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Background task failed"),
            Err(_) => tracing::error!(
                task = name,
                timeout = ?self.drain_timeout,
                "Background task did not stop before the drain timeout"
            ),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
