//! Supervision of the search server child process
//!
//! The supervisor owns at most one server child. Its pid is persisted so a
//! restarted supervisor refuses to launch a second server next to a live one.
//! Stopping is graceful first (SIGTERM), forceful after the grace window
//! (SIGKILL), and always clears the persisted pid.

pub mod pidfile;

use crate::config::Config;
use crate::dataset::ServerControl;
use crate::utils::error::ProcessError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Interval between liveness polls while waiting for a foreign pid to exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a SIGKILLed foreign pid gets to disappear
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Check whether `pid` refers to a live process
///
/// Pure query: signal 0 performs only the existence and permission checks.
/// Zero and negative pids are never running.
pub fn is_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 delivers nothing.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: pid is positive, so this never targets a process group.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Observed state of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// No server has been started by this supervisor
    NotStarted,
    /// The child is alive
    Running(i32),
    /// The child exited on its own
    Exited(ExitStatus),
}

/// Starts, monitors and stops the server process
#[derive(Debug)]
pub struct ProcessSupervisor {
    program: PathBuf,
    args: Vec<OsString>,
    pid_file: PathBuf,
    startup_check: Duration,
    stop_grace: Duration,
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            pid_file: pid_file.into(),
            startup_check: Duration::from_secs(5),
            stop_grace: Duration::from_secs(60),
            child: None,
        }
    }

    /// Supervisor for the configured server, launched with pass-through `args`
    pub fn from_config(config: &Config, args: Vec<OsString>) -> Self {
        Self::new(config.server.program.clone(), args, config.layout().pid_file())
            .with_timings(config.startup_check(), config.stop_grace())
    }

    #[must_use]
    pub fn with_timings(mut self, startup_check: Duration, stop_grace: Duration) -> Self {
        self.startup_check = startup_check;
        self.stop_grace = stop_grace;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Pid of the owned child, if any
    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().and_then(Child::id).map(|id| id as i32)
    }

    /// Launch the server
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if the owned child or the persisted pid is alive;
    ///   nothing is launched in that case
    /// - `StartupFailure` if the child exits within the startup check window
    pub async fn start(&mut self) -> Result<i32, ProcessError> {
        if let Some(child) = self.child.as_mut() {
            if child.try_wait()?.is_none() {
                let pid = child.id().map_or(0, |id| id as i32);
                return Err(ProcessError::AlreadyRunning(pid));
            }
            self.child = None;
        }

        if let Some(pid) = pidfile::read_pid(&self.pid_file) {
            if is_running(pid) {
                return Err(ProcessError::AlreadyRunning(pid));
            }
            tracing::warn!(pid = pid, path = %self.pid_file.display(), "Discarding stale pid file");
            pidfile::clear_pid(&self.pid_file)?;
        }

        tracing::info!(
            program = %self.program.display(),
            args = ?self.args,
            "Starting server"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let pid = child.id().map_or(0, |id| id as i32);
        if let Err(e) = pidfile::write_pid(&self.pid_file, pid) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e.into());
        }

        tokio::time::sleep(self.startup_check).await;

        if let Some(status) = child.try_wait()? {
            pidfile::clear_pid(&self.pid_file)?;
            tracing::error!(pid = pid, status = %status, "Server exited during startup");
            return Err(ProcessError::StartupFailure {
                status: status.to_string(),
            });
        }

        tracing::info!(pid = pid, "Server started");
        self.child = Some(child);
        Ok(pid)
    }

    /// Stop the server: SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Without an owned child, the persisted pid is stopped instead. With
    /// neither, the server is already stopped and this is a no-op. The pid
    /// file is cleared in every case.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), ProcessError> {
        let result = match self.child.take() {
            Some(child) => stop_child(child, grace).await,
            None => match pidfile::read_pid(&self.pid_file) {
                Some(pid) if is_running(pid) => stop_pid(pid, grace).await,
                _ => {
                    tracing::debug!("Server already stopped");
                    Ok(())
                }
            },
        };

        if let Err(e) = pidfile::clear_pid(&self.pid_file) {
            tracing::warn!(path = %self.pid_file.display(), error = %e, "Failed to clear pid file");
        }

        result
    }

    /// Non-blocking check on the owned child
    pub fn status(&mut self) -> Result<ServerStatus, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(ServerStatus::NotStarted);
        };

        match child.try_wait()? {
            None => Ok(ServerStatus::Running(child.id().map_or(0, |id| id as i32))),
            Some(status) => {
                self.child = None;
                pidfile::clear_pid(&self.pid_file)?;
                Ok(ServerStatus::Exited(status))
            }
        }
    }
}

async fn stop_child(mut child: Child, grace: Duration) -> Result<(), ProcessError> {
    if let Some(status) = child.try_wait()? {
        tracing::info!(status = %status, "Server had already exited");
        return Ok(());
    }

    let pid = child.id().map_or(0, |id| id as i32);
    tracing::info!(pid = pid, grace_secs = grace.as_secs(), "Stopping server");

    #[cfg(unix)]
    send_signal(pid, libc::SIGTERM)?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            tracing::info!(pid = pid, status = %status, "Server stopped");
            Ok(())
        }
        Err(_) => {
            tracing::warn!(pid = pid, "Server ignored SIGTERM, sending SIGKILL");
            child.start_kill()?;
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    tracing::info!(pid = pid, status = %status, "Server killed");
                    Ok(())
                }
                Err(_) => Err(ProcessError::ShutdownTimeout {
                    pid,
                    waited_secs: (grace + KILL_WAIT).as_secs(),
                }),
            }
        }
    }
}

/// Stop a server this supervisor did not launch
async fn stop_pid(pid: i32, grace: Duration) -> Result<(), ProcessError> {
    tracing::info!(pid = pid, grace_secs = grace.as_secs(), "Stopping server from pid file");

    #[cfg(unix)]
    send_signal(pid, libc::SIGTERM)?;

    if wait_until_gone(pid, grace).await {
        return Ok(());
    }

    tracing::warn!(pid = pid, "Server ignored SIGTERM, sending SIGKILL");
    #[cfg(unix)]
    send_signal(pid, libc::SIGKILL)?;

    if wait_until_gone(pid, KILL_WAIT).await {
        Ok(())
    } else {
        Err(ProcessError::ShutdownTimeout {
            pid,
            waited_secs: (grace + KILL_WAIT).as_secs(),
        })
    }
}

async fn wait_until_gone(pid: i32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !is_running(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl ServerControl for ProcessSupervisor {
    async fn stop_server(&mut self) -> Result<(), ProcessError> {
        let grace = self.stop_grace;
        self.stop(grace).await
    }
}
