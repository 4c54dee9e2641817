//! Update orchestrator
//!
//! Top-level state machine. At startup it decides between an initial fetch,
//! serving the current dataset, or serving it while a background update
//! installs a newer one. While serving it polls the server, re-checks the
//! remote version periodically and reacts to update outcomes.
//!
//! # State transitions
//!
//! ```text
//! NoIndex ──initial fetch──▶ IndexCurrent
//! IndexStale ──spawn──▶ UpdateInFlight ──success──▶ IndexCurrent
//!                                      └─failure──▶ IndexStale
//! ```

pub mod update;

use crate::config::{Config, DataLayout};
use crate::dataset::{self, DatasetSwapper, RecoveryOutcome};
use crate::error::Result;
use crate::fetcher::ArchiveFetcher;
use crate::metrics;
use crate::process::{ProcessSupervisor, ServerStatus};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{TokenStore, VersionToken};
use crate::utils::error::{ProcessError, SwapError, UpdateError};
use std::ffi::OsString;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use update::{UpdateContext, UpdateTask};

/// Clean shutdown, or a handled background failure
pub const EXIT_OK: i32 = 0;

/// Fatal startup failure, lost server or critical restore failure
pub const EXIT_FAILURE: i32 = 1;

/// Freshness of the served dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No valid dataset on disk
    NoIndex,
    /// Remote has a different version than the one being served
    IndexStale,
    /// Serving the latest known version, or version tracking is unavailable
    IndexCurrent,
    /// A background update is running
    UpdateInFlight,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoIndex => "no_index",
            Self::IndexStale => "index_stale",
            Self::IndexCurrent => "index_current",
            Self::UpdateInFlight => "update_in_flight",
        }
    }
}

/// Decide what to do with the dataset on disk
///
/// A missing token on either side degrades to `IndexCurrent`: serving is
/// never blocked on version tracking.
pub fn decide(valid: bool, remote: Option<&VersionToken>, started: Option<&VersionToken>) -> IndexState {
    if !valid {
        return IndexState::NoIndex;
    }
    match (remote, started) {
        (Some(remote), Some(started)) if remote != started => IndexState::IndexStale,
        _ => IndexState::IndexCurrent,
    }
}

/// Owns the dataset paths, the server and the single background update
pub struct Orchestrator {
    config: Config,
    layout: DataLayout,
    fetcher: Arc<ArchiveFetcher>,
    swapper: DatasetSwapper,
    supervisor: Arc<Mutex<ProcessSupervisor>>,
    tokens: TokenStore,
    coordinator: ShutdownCoordinator,
    update: Option<UpdateTask>,
    state: IndexState,

    /// Set while an initial fetch may have left a partial dataset behind
    initial_fetch_pending: bool,
}

impl Orchestrator {
    /// Create an orchestrator whose server is launched with `server_args`
    pub fn new(config: Config, server_args: Vec<OsString>) -> Result<Self> {
        let supervisor = ProcessSupervisor::from_config(&config, server_args);
        Self::with_supervisor(config, supervisor)
    }

    /// Create an orchestrator around an existing supervisor
    pub fn with_supervisor(config: Config, supervisor: ProcessSupervisor) -> Result<Self> {
        let layout = config.layout();
        let fetcher = Arc::new(ArchiveFetcher::new(&config)?);
        let tokens = TokenStore::new(layout.latest_token_file(), layout.started_token_file());

        Ok(Self {
            swapper: DatasetSwapper::from_config(&config),
            coordinator: ShutdownCoordinator::from_config(&config),
            supervisor: Arc::new(Mutex::new(supervisor)),
            fetcher,
            tokens,
            layout,
            config,
            update: None,
            state: IndexState::NoIndex,
            initial_fetch_pending: false,
        })
    }

    /// Current state; `UpdateInFlight` until the task's outcome is handled
    pub fn state(&self) -> IndexState {
        if self.update.is_some() {
            IndexState::UpdateInFlight
        } else {
            self.state
        }
    }

    pub fn update_in_flight(&self) -> bool {
        self.update.is_some()
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn supervisor(&self) -> Arc<Mutex<ProcessSupervisor>> {
        Arc::clone(&self.supervisor)
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Bring the server up and, if the dataset is stale, launch the update
    ///
    /// # Errors
    ///
    /// Any error is fatal: the initial fetch failed or the server could not
    /// be started.
    pub async fn startup(&mut self) -> Result<IndexState> {
        let live = self.layout.live_node_dir();

        self.remove_tmp().await;
        match dataset::recover_interrupted_swap(&live)? {
            RecoveryOutcome::NothingToDo => {}
            RecoveryOutcome::RemovedStaleBackups(n) => {
                tracing::info!(count = n, "Removed backups left by an earlier swap");
            }
            RecoveryOutcome::RestoredBackup(backup) => {
                tracing::warn!(backup = %backup.display(), "Recovered dataset from an interrupted swap");
            }
        }

        let valid = dataset::is_valid_dataset(&live);
        let remote = self.fetch_remote_token().await;
        let started = self.tokens.started();
        let decision = decide(valid, remote.as_ref(), started.as_ref());

        tracing::info!(
            state = decision.as_str(),
            remote = remote.as_ref().map(VersionToken::as_str),
            started = started.as_ref().map(VersionToken::as_str),
            "Dataset state at startup"
        );

        if decision == IndexState::NoIndex {
            self.initial_fetch().await?;
        } else if remote.is_none() || started.is_none() {
            tracing::warn!("Version tracking unavailable, serving the existing dataset");
        }

        let pid = self.supervisor.lock().await.start().await?;
        metrics::record_server_start();
        tracing::info!(pid = pid, "Server up");

        self.state = match decision {
            IndexState::NoIndex => {
                if let Some(token) = &remote {
                    if let Err(e) = self.tokens.save_started(token) {
                        tracing::warn!(error = %e, "Failed to persist started token");
                    }
                }
                IndexState::IndexCurrent
            }
            other => other,
        };

        if self.state == IndexState::IndexStale {
            if let Some(target) = remote {
                self.spawn_update(target);
            }
        }

        self.export_metrics();
        Ok(self.state())
    }

    /// Fetch straight into the dataset root; nothing live to preserve
    async fn initial_fetch(&mut self) -> Result<()> {
        let root = self.layout.dataset_root();
        let live = self.layout.live_node_dir();
        tracing::info!(path = %root.display(), "No valid dataset, performing initial fetch");

        self.initial_fetch_pending = true;
        self.fetcher.fetch(&root, false).await?;
        dataset::normalize_layout(
            &root,
            &live,
            &self.config.update.node_dir_prefix,
            self.config.update.search_depth,
        )?;

        if !dataset::is_valid_dataset(&live) {
            return Err(SwapError::InvalidCandidateStructure(format!(
                "{} is empty after the initial fetch",
                live.display()
            ))
            .into());
        }

        self.initial_fetch_pending = false;
        tracing::info!(path = %live.display(), "Initial dataset installed");
        Ok(())
    }

    /// Remote token, persisted as the latest on success; `None` on failure
    async fn fetch_remote_token(&self) -> Option<VersionToken> {
        match self.fetcher.fetch_version_token().await {
            Ok(token) => {
                if let Err(e) = self.tokens.save_latest(&token) {
                    tracing::warn!(error = %e, "Failed to persist latest token");
                }
                Some(token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remote version unavailable");
                None
            }
        }
    }

    fn spawn_update(&mut self, target: VersionToken) {
        if let Some(task) = &self.update {
            tracing::debug!(target = %task.target(), "Update already in flight");
            return;
        }

        let ctx = UpdateContext {
            fetcher: Arc::clone(&self.fetcher),
            swapper: self.swapper.clone(),
            supervisor: Arc::clone(&self.supervisor),
            tokens: self.tokens.clone(),
            tmp_dir: self.layout.tmp_dir(),
            live_dir: self.layout.live_node_dir(),
            settle_delay: self.config.settle_delay(),
        };

        metrics::record_update_started();
        self.update = Some(UpdateTask::spawn(ctx, target));
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Re-check the remote version and launch an update if it moved
    ///
    /// Returns `None` when an update is already in flight.
    pub async fn check_for_update(&mut self) -> Option<IndexState> {
        if self.update_in_flight() {
            return None;
        }

        let remote = self.fetch_remote_token().await;
        let started = self.tokens.started();
        let valid = dataset::is_valid_dataset(&self.layout.live_node_dir());

        let decision = decide(valid, remote.as_ref(), started.as_ref());
        tracing::info!(state = decision.as_str(), "Periodic version check");

        match (decision, remote) {
            (IndexState::IndexStale, Some(target)) => {
                self.state = IndexState::IndexStale;
                self.spawn_update(target);
            }
            (IndexState::IndexCurrent, _) => self.state = IndexState::IndexCurrent,
            _ => {}
        }
        Some(self.state())
    }

    /// Wait for the in-flight update and handle its outcome
    pub async fn wait_for_update(&mut self) -> Option<std::result::Result<VersionToken, UpdateError>> {
        let result = self.update.as_mut()?.join().await;
        self.finish_update(&result);
        Some(result)
    }

    /// Record an update outcome; returns an exit code if it is fatal
    fn finish_update(&mut self, result: &std::result::Result<VersionToken, UpdateError>) -> Option<i32> {
        self.update = None;

        let exit = match result {
            Ok(token) => {
                tracing::info!(token = %token, "Update succeeded");
                self.state = IndexState::IndexCurrent;
                metrics::record_update_finished(true);
                None
            }
            Err(e) if e.is_critical() => {
                tracing::error!(
                    operator_action_required = true,
                    error = %e,
                    "CRITICAL: restore failed, shutting down"
                );
                metrics::record_update_finished(false);
                metrics::record_critical_failure();
                Some(EXIT_FAILURE)
            }
            Err(e) if e.leaves_server_down() => {
                tracing::error!(error = %e, "Update failed and the server is not running");
                metrics::record_update_finished(false);
                Some(EXIT_FAILURE)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Update failed, continuing with the current dataset");
                self.state = IndexState::IndexStale;
                metrics::record_update_finished(false);
                None
            }
        };

        self.export_metrics();
        exit
    }

    /// Liveness poll; returns an exit code once the server is gone
    fn poll_server(&self) -> Option<i32> {
        // Held by an update for the duration of a swap.
        let Ok(mut supervisor) = self.supervisor.try_lock() else {
            return None;
        };

        match supervisor.status() {
            Ok(ServerStatus::Running(_)) => None,
            Ok(ServerStatus::Exited(status)) if status.success() => {
                tracing::info!(status = %status, "Server exited");
                Some(EXIT_OK)
            }
            Ok(ServerStatus::Exited(status)) => {
                tracing::error!(status = %status, "Server exited unexpectedly");
                Some(EXIT_FAILURE)
            }
            Ok(ServerStatus::NotStarted) => {
                tracing::error!("Server is not running");
                Some(EXIT_FAILURE)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll server");
                None
            }
        }
    }

    /// Run startup, then serve until `shutdown` resolves or the server is lost
    ///
    /// Returns the process exit code.
    pub async fn run<F>(mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let started = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            result = self.startup() => Some(result),
        };

        match started {
            None => {
                tracing::info!("Shutdown requested during startup");
                self.discard_partial_dataset();
                return self.finish(EXIT_OK).await;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Startup failed");
                self.discard_partial_dataset();
                return self.finish(EXIT_FAILURE).await;
            }
            Some(Ok(state)) => {
                tracing::info!(state = state.as_str(), "Serving");
            }
        }

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_every = self.config.check_interval();
        let mut next_check = check_every.map(|every| Instant::now() + every);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return self.finish(EXIT_OK).await,
                result = join_update(&mut self.update) => {
                    if let Some(code) = self.finish_update(&result) {
                        return self.finish(code).await;
                    }
                }
                _ = poll.tick() => {
                    if let Some(code) = self.poll_server() {
                        return self.finish(code).await;
                    }
                }
                _ = sleep_until(next_check) => {
                    next_check = check_every.map(|every| Instant::now() + every);
                    let interrupted = tokio::select! {
                        biased;
                        _ = &mut shutdown => true,
                        _ = self.check_for_update() => false,
                    };
                    if interrupted {
                        return self.finish(EXIT_OK).await;
                    }
                }
            }
        }
    }

    /// Run the shutdown sequence
    pub async fn shutdown(&mut self) -> std::result::Result<(), ProcessError> {
        let task = self.update.take();
        self.coordinator.run(task, &self.supervisor).await
    }

    async fn finish(&mut self, code: i32) -> i32 {
        let code = match self.shutdown().await {
            Ok(()) => code,
            Err(_) => EXIT_FAILURE,
        };
        self.export_metrics();
        tracing::info!(exit_code = code, "Supervisor exiting");
        code
    }

    /// Remove what an interrupted or failed initial fetch left behind
    fn discard_partial_dataset(&mut self) {
        if !self.initial_fetch_pending {
            return;
        }
        self.initial_fetch_pending = false;

        let root = self.layout.dataset_root();
        match std::fs::remove_dir_all(&root) {
            Ok(()) => tracing::info!(path = %root.display(), "Removed partial initial dataset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %root.display(), error = %e, "Failed to remove partial initial dataset"),
        }
    }

    async fn remove_tmp(&self) {
        let tmp = self.layout.tmp_dir();
        match tokio::fs::remove_dir_all(&tmp).await {
            Ok(()) => tracing::info!(path = %tmp.display(), "Removed stale temporary directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %tmp.display(), error = %e, "Failed to remove temporary directory"),
        }
    }

    fn export_metrics(&self) {
        let path = self.layout.metrics_file();
        if let Err(e) = metrics::write_textfile(&path) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }
}

/// Resolves with the outcome of the in-flight update; pending without one
async fn join_update(update: &mut Option<UpdateTask>) -> std::result::Result<VersionToken, UpdateError> {
    match update.as_mut() {
        Some(task) => task.join().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
