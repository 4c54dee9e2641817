//! Hot swap of the live node directory
//!
//! The swap stops the server, renames the live directory to a timestamped
//! backup, renames the candidate into place and validates it. Any failure
//! after the backup exists moves the backup back. A failed move-back is the
//! one unrecoverable outcome and is reported as `CriticalRestoreFailure`.
//!
//! Everything between the first rename and the final validation is plain
//! synchronous code, so cancelling the owning task cannot interrupt it.

use super::{backup_path, find_node_dir, is_valid_dataset, remove_path};
use crate::config::Config;
use crate::utils::error::{ProcessError, SwapError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// The part of the process supervisor the swapper depends on
#[async_trait]
pub trait ServerControl: Send {
    /// Stop the server and wait until it no longer holds the dataset open
    async fn stop_server(&mut self) -> Result<(), ProcessError>;
}

/// Replaces the live node directory with a validated candidate
#[derive(Debug, Clone)]
pub struct DatasetSwapper {
    node_prefix: String,
    search_depth: usize,
}

impl DatasetSwapper {
    pub fn new(node_prefix: impl Into<String>, search_depth: usize) -> Self {
        Self {
            node_prefix: node_prefix.into(),
            search_depth,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.update.node_dir_prefix.clone(), config.update.search_depth)
    }

    /// Swap the node directory found in `candidate_dir` into `live_dir`
    ///
    /// On success the backup and `candidate_dir` are deleted. On failure the
    /// prior live directory is back in place, unless the error is
    /// `CriticalRestoreFailure`.
    pub async fn swap<S>(&self, candidate_dir: &Path, live_dir: &Path, server: &mut S) -> Result<(), SwapError>
    where
        S: ServerControl + ?Sized,
    {
        let candidate = find_node_dir(candidate_dir, &self.node_prefix, self.search_depth)?;
        tracing::info!(
            candidate = %candidate.display(),
            live = %live_dir.display(),
            "Candidate dataset located, stopping server for swap"
        );

        server
            .stop_server()
            .await
            .map_err(|e| SwapError::StopFailed(e.to_string()))?;

        let backup = install(&candidate, live_dir)?;

        if let Some(backup) = &backup {
            if let Err(e) = tokio::fs::remove_dir_all(backup).await {
                tracing::warn!(path = %backup.display(), error = %e, "Failed to remove dataset backup");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(candidate_dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %candidate_dir.display(), error = %e, "Failed to remove candidate directory");
            }
        }

        tracing::info!(live = %live_dir.display(), "Dataset swap complete");
        Ok(())
    }
}

/// Rename sequence; returns the backup path to delete on success
fn install(candidate: &Path, live: &Path) -> Result<Option<PathBuf>, SwapError> {
    let backup = if live.symlink_metadata().is_ok() {
        let backup = backup_path(live);
        std::fs::rename(live, &backup).map_err(|e| {
            SwapError::SwapFailure(format!(
                "failed to move {} to backup {}: {e}",
                live.display(),
                backup.display()
            ))
        })?;
        tracing::info!(backup = %backup.display(), "Live dataset moved to backup");
        Some(backup)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(candidate, live) {
        let failure = if e.kind() == io::ErrorKind::NotFound {
            SwapError::InvalidCandidateStructure(format!(
                "candidate {} disappeared before it could be moved into place",
                candidate.display()
            ))
        } else {
            SwapError::SwapFailure(format!(
                "failed to move {} to {}: {e}",
                candidate.display(),
                live.display()
            ))
        };
        return Err(rollback(backup.as_deref(), live, failure));
    }

    if !is_valid_dataset(live) {
        let failure = SwapError::InvalidCandidateStructure(format!(
            "{} is empty after the move",
            live.display()
        ));
        return Err(rollback(backup.as_deref(), live, failure));
    }

    Ok(backup)
}

/// Put the backup back and return the error to report
fn rollback(backup: Option<&Path>, live: &Path, failure: SwapError) -> SwapError {
    tracing::warn!(error = %failure, "Dataset swap failed, restoring backup");

    let Some(backup) = backup else {
        return failure;
    };

    let restored = match live.symlink_metadata() {
        Ok(_) => remove_path(live),
        Err(_) => Ok(()),
    }
    .and_then(|()| std::fs::rename(backup, live));

    match restored {
        Ok(()) => {
            tracing::info!(live = %live.display(), "Previous dataset restored");
            failure
        }
        Err(e) => {
            tracing::error!(
                operator_action_required = true,
                backup = %backup.display(),
                live = %live.display(),
                error = %e,
                swap_error = %failure,
                "CRITICAL: restore failed, dataset requires manual recovery"
            );
            SwapError::CriticalRestoreFailure {
                backup: backup.to_path_buf(),
                live: live.to_path_buf(),
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Records stops and optionally tampers with the filesystem while
    /// "stopped"
    struct FakeServer {
        stops: u32,
        on_stop: Option<Box<dyn FnMut() + Send>>,
        fail: bool,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                stops: 0,
                on_stop: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ServerControl for FakeServer {
        async fn stop_server(&mut self) -> Result<(), ProcessError> {
            self.stops += 1;
            if let Some(hook) = self.on_stop.as_mut() {
                hook();
            }
            if self.fail {
                return Err(ProcessError::ShutdownTimeout { pid: 7, waited_secs: 60 });
            }
            Ok(())
        }
    }

    fn populate(dir: &Path, content: &[u8]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("segment.dat"), content).unwrap();
    }

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("index/node_1");
        populate(&live, b"old");
        let candidate = dir.path().join("tmp");
        populate(&candidate.join("export/node_1"), b"new");
        (dir, candidate, live)
    }

    #[tokio::test]
    async fn test_swap_success() {
        let (_dir, candidate, live) = fixture();
        let mut server = FakeServer::new();

        DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut server)
            .await
            .unwrap();

        assert_eq!(server.stops, 1);
        assert_eq!(fs::read(live.join("segment.dat")).unwrap(), b"new");
        assert!(!candidate.exists());
        assert!(super::super::list_backups(&live).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_swap_without_prior_live_dir() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("index/node_1");
        fs::create_dir_all(dir.path().join("index")).unwrap();
        let candidate = dir.path().join("tmp");
        populate(&candidate.join("node_1"), b"new");

        DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut FakeServer::new())
            .await
            .unwrap();
        assert!(is_valid_dataset(&live));
    }

    #[tokio::test]
    async fn test_invalid_candidate_leaves_server_running() {
        let (_dir, candidate, live) = fixture();
        fs::remove_dir_all(candidate.join("export")).unwrap();
        let mut server = FakeServer::new();

        let err = DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut server)
            .await
            .unwrap_err();

        assert!(matches!(err, SwapError::InvalidCandidateStructure(_)));
        assert_eq!(server.stops, 0);
        assert_eq!(fs::read(live.join("segment.dat")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_candidate_vanishing_after_stop_restores_backup() {
        let (_dir, candidate, live) = fixture();
        let doomed = candidate.join("export");
        let mut server = FakeServer::new();
        server.on_stop = Some(Box::new(move || {
            fs::remove_dir_all(&doomed).unwrap();
        }));

        let err = DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut server)
            .await
            .unwrap_err();

        assert!(matches!(err, SwapError::InvalidCandidateStructure(_)));
        assert_eq!(fs::read(live.join("segment.dat")).unwrap(), b"old");
        assert!(super::super::list_backups(&live).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_candidate_emptied_after_stop_restores_backup() {
        let (_dir, candidate, live) = fixture();
        let segment = candidate.join("export/node_1/segment.dat");
        let mut server = FakeServer::new();
        server.on_stop = Some(Box::new(move || {
            fs::remove_file(&segment).unwrap();
        }));

        let err = DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut server)
            .await
            .unwrap_err();

        assert!(matches!(err, SwapError::InvalidCandidateStructure(_)));
        assert!(is_valid_dataset(&live));
        assert_eq!(fs::read(live.join("segment.dat")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_stop_failure_aborts_before_rename() {
        let (_dir, candidate, live) = fixture();
        let mut server = FakeServer::new();
        server.fail = true;

        let err = DatasetSwapper::new("node_", 4)
            .swap(&candidate, &live, &mut server)
            .await
            .unwrap_err();

        assert!(matches!(err, SwapError::StopFailed(_)));
        assert_eq!(fs::read(live.join("segment.dat")).unwrap(), b"old");
        assert!(candidate.join("export/node_1").exists());
    }

    #[test]
    fn test_rollback_without_backup_returns_original_error() {
        let dir = TempDir::new().unwrap();
        let err = rollback(
            None,
            &dir.path().join("node_1"),
            SwapError::SwapFailure("boom".into()),
        );
        assert!(matches!(err, SwapError::SwapFailure(_)));
    }

    #[test]
    fn test_rollback_with_missing_backup_is_critical() {
        let dir = TempDir::new().unwrap();
        let err = rollback(
            Some(&dir.path().join("node_1.backup.gone")),
            &dir.path().join("node_1"),
            SwapError::SwapFailure("boom".into()),
        );
        assert!(err.is_critical());
    }
}
