//! Free-space precondition for downloads

use crate::utils::error::FetchError;
use crate::utils::format_bytes;
use std::io;
use std::path::Path;

/// Free bytes on the filesystem holding `path`
///
/// `path` itself may not exist yet; the nearest existing ancestor is queried.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new("."));
    fs2::available_space(existing)
}

/// Fail with `InsufficientSpace` unless at least `required` bytes are free
pub fn ensure_free_space(path: &Path, required: u64) -> Result<u64, FetchError> {
    let available = available_space(path)?;

    if available < required {
        tracing::error!(
            path = %path.display(),
            available = %format_bytes(available),
            required = %format_bytes(required),
            "Not enough free space for dataset download"
        );
        return Err(FetchError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required,
        });
    }

    tracing::debug!(
        path = %path.display(),
        available = %format_bytes(available),
        "Free space check passed"
    );
    Ok(available)
}
