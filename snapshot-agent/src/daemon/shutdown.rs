//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the shared token. Backup loops observe it at their next
//! sleep or between passes, so:
//! - a running sync is allowed to finish and commit
//! - no loop is abandoned with an in-progress snapshot
//!
//! One-off passes get the same treatment through [`ShutdownCoordinator::run_to_completion`].

use std::future::Future;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT), then cancel the token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Stopping backups on user request (Ctrl+C)...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping backups...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Drive `work` to the end while listening for shutdown signals.
    ///
    /// A signal cancels the token but does not interrupt `work`: the sync
    /// subprocess lives in its own process group, and dropping it halfway
    /// would leave an orphaned transfer behind.
    pub async fn run_to_completion<F: Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        tokio::select! {
            output = &mut work => return output,
            _ = self.wait_for_signal() => {
                info!("Letting the running backup finish before exiting...");
            }
        }
        work.await
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
