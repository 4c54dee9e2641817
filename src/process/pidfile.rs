//! Persisted server pid
//!
//! The pid survives a restart of the supervisor itself, so a new supervisor
//! can tell whether a server it did not launch is still around.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Read the pid stored at `path`; malformed or non-positive values are ignored
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// Persist `pid` to `path` via a temp file and rename
pub fn write_pid(path: &Path, pid: i32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("pid.tmp");
    let mut file = fs::File::create(&temp_path)?;
    writeln!(file, "{pid}")?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

/// Remove the pid file; a missing file is not an error
pub fn clear_pid(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
