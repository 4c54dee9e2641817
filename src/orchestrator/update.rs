//! Background dataset update
//!
//! An [`UpdateTask`] fetches a candidate into the temporary directory, swaps
//! it into place and restarts the server, while the foreground server keeps
//! serving the current dataset until the swap itself. Cancellation is checked
//! between stages; a download in progress is never interrupted by it.

use crate::dataset::DatasetSwapper;
use crate::fetcher::ArchiveFetcher;
use crate::process::{ProcessSupervisor, ServerStatus};
use crate::storage::{TokenStore, VersionToken};
use crate::utils::error::{SwapError, UpdateError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Everything an update needs, cloned out of the orchestrator
#[derive(Clone)]
pub struct UpdateContext {
    pub fetcher: Arc<ArchiveFetcher>,
    pub swapper: DatasetSwapper,
    pub supervisor: Arc<Mutex<ProcessSupervisor>>,
    pub tokens: TokenStore,
    pub tmp_dir: PathBuf,
    pub live_dir: PathBuf,
    pub settle_delay: Duration,
}

// ============================================================================
// Update Task
// ============================================================================

/// Handle to the single in-flight update
pub struct UpdateTask {
    handle: JoinHandle<Result<VersionToken, UpdateError>>,
    cancel: watch::Sender<bool>,
    target: VersionToken,
}

impl UpdateTask {
    /// Spawn an update that installs the dataset identified by `target`
    pub fn spawn(ctx: UpdateContext, target: VersionToken) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let task_target = target.clone();

        tracing::info!(target = %target, settle_secs = ctx.settle_delay.as_secs(), "Starting background update");
        let handle = tokio::spawn(run_update(ctx, task_target, cancel_rx));

        Self {
            handle,
            cancel,
            target,
        }
    }

    /// Version this task is installing
    pub fn target(&self) -> &VersionToken {
        &self.target
    }

    /// Wait for the task to finish
    ///
    /// Cancel-safe: dropping the returned future leaves the task running.
    pub async fn join(&mut self) -> Result<VersionToken, UpdateError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(UpdateError::Aborted(e.to_string())),
        }
    }

    /// Ask the task to stop, abort it if it has not finished within `grace`
    pub async fn cancel(mut self, grace: Duration) -> Result<VersionToken, UpdateError> {
        let _ = self.cancel.send(true);

        match tokio::time::timeout(grace, self.join()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "Update task unresponsive, aborting");
                self.handle.abort();
                match (&mut self.handle).await {
                    Ok(result) => result,
                    Err(e) => Err(UpdateError::Aborted(e.to_string())),
                }
            }
        }
    }
}

fn cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Wait for `delay` unless cancelled first; true if the delay elapsed
///
/// A dropped sender counts as cancellation.
async fn settle(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if cancelled(rx) {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return true,
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_update(
    ctx: UpdateContext,
    target: VersionToken,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<VersionToken, UpdateError> {
    if !settle(ctx.settle_delay, &mut cancel_rx).await {
        return Err(UpdateError::Cancelled);
    }

    let result = fetch_and_swap(&ctx, &target, &cancel_rx).await;

    if let Err(e) = tokio::fs::remove_dir_all(&ctx.tmp_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %ctx.tmp_dir.display(), error = %e, "Failed to remove temporary directory");
        }
    }

    result
}

async fn fetch_and_swap(
    ctx: &UpdateContext,
    target: &VersionToken,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<VersionToken, UpdateError> {
    tracing::info!(path = %ctx.tmp_dir.display(), "Fetching candidate dataset");
    ctx.fetcher.fetch(&ctx.tmp_dir, true).await?;

    if cancelled(cancel_rx) {
        return Err(UpdateError::Cancelled);
    }

    // Held through stop, swap and restart so the liveness poll never
    // observes the intentional stop.
    let mut supervisor = ctx.supervisor.lock().await;

    match ctx
        .swapper
        .swap(&ctx.tmp_dir, &ctx.live_dir, &mut *supervisor)
        .await
    {
        Ok(()) => {
            supervisor.start().await.map_err(UpdateError::Restart)?;
            crate::metrics::record_server_start();

            if let Err(e) = ctx.tokens.save_started(target) {
                tracing::warn!(error = %e, "New dataset is serving but its token could not be saved");
            }
            tracing::info!(token = %target, "Background update complete, server serving new dataset");
            Ok(target.clone())
        }
        Err(e) if e.is_critical() => Err(e.into()),
        Err(e @ SwapError::StopFailed(_)) => Err(e.into()),
        Err(e) => {
            restart_if_stopped(&mut supervisor).await?;
            Err(e.into())
        }
    }
}

/// Bring the server back on the restored dataset if the swap had stopped it
async fn restart_if_stopped(supervisor: &mut ProcessSupervisor) -> Result<(), UpdateError> {
    if let Ok(ServerStatus::Running(_)) = supervisor.status() {
        return Ok(());
    }

    tracing::info!("Restarting server with the restored dataset");
    supervisor.start().await.map_err(UpdateError::Restart)?;
    crate::metrics::record_server_start();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settle_elapses() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(settle(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test]
    async fn test_settle_interrupted_by_cancel() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { settle(Duration::from_secs(30), &mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_settle_skipped_when_already_cancelled() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!settle(Duration::from_secs(30), &mut rx).await);
    }
}
