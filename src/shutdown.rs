//! Orderly teardown on termination
//!
//! The sequence always runs to completion: the in-flight update (if any) is
//! cancelled and aborted after a bounded grace period, the server is stopped,
//! and the temporary directory is removed.

use crate::config::Config;
use crate::orchestrator::update::UpdateTask;
use crate::process::ProcessSupervisor;
use crate::utils::error::{ProcessError, UpdateError};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Resolve when SIGTERM or SIGINT is received
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to register signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}

/// Drives the shutdown sequence
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    cancel_grace: Duration,
    stop_grace: Duration,
    tmp_dir: PathBuf,
}

impl ShutdownCoordinator {
    pub fn new(cancel_grace: Duration, stop_grace: Duration, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cancel_grace,
            stop_grace,
            tmp_dir: tmp_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cancel_grace(), config.stop_grace(), config.layout().tmp_dir())
    }

    /// Cancel `task`, stop the server and remove the temporary directory
    ///
    /// Returns the result of stopping the server; every step runs even if an
    /// earlier one failed.
    pub async fn run(&self, task: Option<UpdateTask>, supervisor: &Mutex<ProcessSupervisor>) -> Result<(), ProcessError> {
        tracing::info!("Shutting down");

        if let Some(task) = task {
            tracing::info!(target = %task.target(), "Cancelling background update");
            match task.cancel(self.cancel_grace).await {
                Ok(token) => {
                    tracing::info!(token = %token, "Background update finished before shutdown");
                    crate::metrics::record_update_finished(true);
                }
                Err(UpdateError::Cancelled) | Err(UpdateError::Aborted(_)) => {
                    tracing::info!("Background update cancelled");
                    crate::metrics::record_update_finished(false);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Background update failed during shutdown");
                    crate::metrics::record_update_finished(false);
                }
            }
        }

        let stopped = supervisor.lock().await.stop(self.stop_grace).await;
        if let Err(e) = &stopped {
            tracing::error!(error = %e, "Failed to stop server");
        }

        match tokio::fs::remove_dir_all(&self.tmp_dir).await {
            Ok(()) => tracing::info!(path = %self.tmp_dir.display(), "Removed temporary directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.tmp_dir.display(), error = %e, "Failed to remove temporary directory"),
        }

        tracing::info!("Shutdown complete");
        stopped
    }
}
