//! Dataset directory handling
//!
//! The dataset root holds one directory per index node (in practice exactly
//! one, `node_1`). A dataset is valid iff that node directory exists and is
//! non-empty. This module also locates the node directory inside a freshly
//! extracted archive and repairs the layout after an interrupted swap.

pub mod swap;

pub use swap::{DatasetSwapper, ServerControl};

use crate::utils::error::SwapError;
use crate::utils::timestamp_suffix;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Separator between a node directory name and its backup timestamp
const BACKUP_MARKER: &str = ".backup.";

/// True iff `node_dir` is a directory with at least one entry
pub fn is_valid_dataset(node_dir: &Path) -> bool {
    match std::fs::read_dir(node_dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Locate the single non-empty node directory inside `candidate`
///
/// Archives are not consistent about nesting, so directories whose name
/// starts with `prefix` are searched up to `max_depth` levels deep. Node
/// directories are not descended into. Zero or several non-empty matches
/// are both rejected.
pub fn find_node_dir(candidate: &Path, prefix: &str, max_depth: usize) -> Result<PathBuf, SwapError> {
    if !candidate.is_dir() {
        return Err(SwapError::InvalidCandidateStructure(format!(
            "{} is not a directory",
            candidate.display()
        )));
    }

    let mut found = Vec::new();
    let mut walker = WalkDir::new(candidate)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            SwapError::InvalidCandidateStructure(format!("failed to scan {}: {e}", candidate.display()))
        })?;

        if !entry.file_type().is_dir() {
            continue;
        }

        let is_node = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix) && !name.contains(BACKUP_MARKER));

        if is_node {
            if is_valid_dataset(entry.path()) {
                found.push(entry.path().to_path_buf());
            }
            walker.skip_current_dir();
        }
    }

    found.sort();
    match found.len() {
        0 => Err(SwapError::InvalidCandidateStructure(format!(
            "no non-empty {prefix}* directory within {max_depth} level(s) of {}",
            candidate.display()
        ))),
        1 => Ok(found.remove(0)),
        _ => Err(SwapError::InvalidCandidateStructure(format!(
            "multiple non-empty node directories: {}",
            found
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Fresh backup path next to `live`
pub fn backup_path(live: &Path) -> PathBuf {
    let name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = timestamp_suffix(Utc::now());

    let mut path = live.with_file_name(format!("{name}{BACKUP_MARKER}{stamp}"));
    let mut n = 1;
    while path.symlink_metadata().is_ok() {
        path = live.with_file_name(format!("{name}{BACKUP_MARKER}{stamp}-{n}"));
        n += 1;
    }
    path
}

/// Backups of `live` left in its parent, oldest first
pub fn list_backups(live: &Path) -> io::Result<Vec<PathBuf>> {
    let (Some(parent), Some(name)) = (live.parent(), live.file_name()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}{BACKUP_MARKER}", name.to_string_lossy());

    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            backups.push(entry.path());
        }
    }
    backups.sort();
    Ok(backups)
}

/// What [`recover_interrupted_swap`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingToDo,
    RemovedStaleBackups(usize),
    RestoredBackup(PathBuf),
}

/// Repair the layout left behind by a supervisor that died mid-swap
///
/// With a valid live directory any leftover backups are deleted. Without
/// one, the newest valid backup is moved back into place.
pub fn recover_interrupted_swap(live: &Path) -> io::Result<RecoveryOutcome> {
    let backups = list_backups(live)?;
    if backups.is_empty() {
        return Ok(RecoveryOutcome::NothingToDo);
    }

    if is_valid_dataset(live) {
        for backup in &backups {
            tracing::info!(path = %backup.display(), "Removing stale dataset backup");
            remove_path(backup)?;
        }
        return Ok(RecoveryOutcome::RemovedStaleBackups(backups.len()));
    }

    let Some(newest) = backups.iter().rev().find(|b| is_valid_dataset(b)).cloned() else {
        tracing::warn!(live = %live.display(), "Only empty dataset backups found, leaving them in place");
        return Ok(RecoveryOutcome::NothingToDo);
    };

    if live.symlink_metadata().is_ok() {
        remove_path(live)?;
    }
    std::fs::rename(&newest, live)?;
    tracing::warn!(
        backup = %newest.display(),
        live = %live.display(),
        "Restored dataset backup left by an interrupted swap"
    );

    for backup in backups.iter().filter(|b| **b != newest) {
        remove_path(backup)?;
    }

    Ok(RecoveryOutcome::RestoredBackup(newest))
}

/// Move the node directory found in a freshly extracted dataset root into
/// its fixed live position
pub fn normalize_layout(dataset_root: &Path, live: &Path, prefix: &str, max_depth: usize) -> Result<(), SwapError> {
    let found = find_node_dir(dataset_root, prefix, max_depth)?;
    if found == live {
        return Ok(());
    }

    if live.symlink_metadata().is_ok() {
        return Err(SwapError::InvalidCandidateStructure(format!(
            "{} exists but the dataset was found at {}",
            live.display(),
            found.display()
        )));
    }

    std::fs::rename(&found, live).map_err(|e| SwapError::SwapFailure(format!(
        "failed to move {} to {}: {e}",
        found.display(),
        live.display()
    )))?;

    // Drop wrapper directories the archive nested the node directory in.
    let mut parent = found.parent();
    while let Some(dir) = parent {
        if dir == dataset_root || std::fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }

    Ok(())
}

pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn node(root: &Path, rel: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("segment.dat"), b"data").unwrap();
        dir
    }

    #[test]
    fn test_validity() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("node_1");
        assert!(!is_valid_dataset(&empty));
        fs::create_dir(&empty).unwrap();
        assert!(!is_valid_dataset(&empty));
        fs::write(empty.join("x"), b"1").unwrap();
        assert!(is_valid_dataset(&empty));
    }

    #[test]
    fn test_find_node_dir_at_varying_depth() {
        let dir = TempDir::new().unwrap();
        let expected = node(dir.path(), "export/2024/node_1");
        assert_eq!(find_node_dir(dir.path(), "node_", 4).unwrap(), expected);
    }

    #[test]
    fn test_find_node_dir_respects_depth() {
        let dir = TempDir::new().unwrap();
        node(dir.path(), "a/b/c/d/node_1");
        assert!(matches!(
            find_node_dir(dir.path(), "node_", 4),
            Err(SwapError::InvalidCandidateStructure(_))
        ));
        assert!(find_node_dir(dir.path(), "node_", 5).is_ok());
    }

    #[test]
    fn test_find_node_dir_rejects_multiple() {
        let dir = TempDir::new().unwrap();
        node(dir.path(), "node_1");
        node(dir.path(), "nested/node_2");
        let err = find_node_dir(dir.path(), "node_", 4).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_find_node_dir_ignores_empty_matches_and_nested_nodes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("node_2")).unwrap();
        let expected = node(dir.path(), "node_1");
        node(dir.path(), "node_1/node_shard");
        assert_eq!(find_node_dir(dir.path(), "node_", 4).unwrap(), expected);
    }

    #[test]
    fn test_recover_restores_newest_backup() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("node_1");
        let old = node(dir.path(), "node_1.backup.20240101000000000");
        let newer = node(dir.path(), "node_1.backup.20240201000000000");

        let outcome = recover_interrupted_swap(&live).unwrap();
        assert_eq!(outcome, RecoveryOutcome::RestoredBackup(newer));
        assert!(is_valid_dataset(&live));
        assert!(!old.exists());
        assert!(list_backups(&live).unwrap().is_empty());
    }

    #[test]
    fn test_recover_removes_stale_backups_when_live_is_valid() {
        let dir = TempDir::new().unwrap();
        let live = node(dir.path(), "node_1");
        node(dir.path(), "node_1.backup.20240101000000000");

        assert_eq!(
            recover_interrupted_swap(&live).unwrap(),
            RecoveryOutcome::RemovedStaleBackups(1)
        );
        assert!(is_valid_dataset(&live));
    }

    #[test]
    fn test_normalize_layout_moves_nested_node() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("index");
        node(&root, "dump/node_1");
        let live = root.join("node_1");

        normalize_layout(&root, &live, "node_", 4).unwrap();
        assert!(is_valid_dataset(&live));
        assert!(!root.join("dump").exists());
    }
}
