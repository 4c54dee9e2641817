//! Error types for the supervisor components
//!
//! Each component reports its own error enum; [`crate::error::Error`] wraps
//! them when they cross module boundaries.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the checksum store
#[derive(Error, Debug)]
pub enum TokenError {
    /// Value does not look like a 32-character hex digest
    #[error("Invalid version token: {0:?}")]
    Invalid(String),

    /// Failed to persist the token
    #[error("Failed to write token to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the archive fetcher
#[derive(Error, Debug)]
pub enum FetchError {
    /// Not enough free space on the destination filesystem
    #[error("Insufficient space at {path}: {available} bytes available, {required} required")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    /// Download failed after exhausting all attempts
    #[error("Download failed after {attempts} attempt(s): {reason}")]
    DownloadFailure { attempts: u32, reason: String },

    /// Archive could not be decompressed or unpacked
    #[error("Extraction failed: {0}")]
    ExtractionFailure(String),

    /// Checksum resource was unreachable or malformed
    #[error("Checksum unavailable: {0}")]
    ChecksumUnavailable(String),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Io(_) => true,
            Self::Http(e) => !e.is_builder(),
            Self::ServerError(status) => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

/// Errors from the dataset swapper
#[derive(Error, Debug)]
pub enum SwapError {
    /// Candidate does not contain exactly one non-empty node directory
    #[error("Invalid candidate structure: {0}")]
    InvalidCandidateStructure(String),

    /// The server could not be stopped before the swap
    #[error("Failed to stop server before swap: {0}")]
    StopFailed(String),

    /// Swap failed and the previous dataset was restored
    #[error("Swap failed (previous dataset restored): {0}")]
    SwapFailure(String),

    /// Swap failed and the backup could not be moved back
    #[error("CRITICAL: restore failed, backup {backup} could not be moved back to {live}: {reason}")]
    CriticalRestoreFailure {
        backup: PathBuf,
        live: PathBuf,
        reason: String,
    },
}

impl SwapError {
    /// Whether operator intervention is required
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalRestoreFailure { .. })
    }
}

/// Errors from the process supervisor
#[derive(Error, Debug)]
pub enum ProcessError {
    /// A live process is already recorded in the pid file
    #[error("Server already running with pid {0}")]
    AlreadyRunning(i32),

    /// The server exited within the startup check window
    #[error("Server exited during startup ({status})")]
    StartupFailure { status: String },

    /// The server could not be spawned at all
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The server survived the forceful termination signal
    #[error("Server with pid {pid} still alive after {waited_secs}s")]
    ShutdownTimeout { pid: i32, waited_secs: u64 },

    /// Pid file or signal delivery error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a background dataset update
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Candidate could not be fetched; the live dataset was not touched
    #[error("Candidate fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Swap failed
    #[error(transparent)]
    Swap(#[from] SwapError),

    /// The server could not be brought back after the swap
    #[error("Server restart after swap failed: {0}")]
    Restart(#[source] ProcessError),

    /// Cancelled at a stage boundary
    #[error("Update cancelled")]
    Cancelled,

    /// The task was aborted or panicked
    #[error("Update task aborted: {0}")]
    Aborted(String),
}

impl UpdateError {
    /// Whether operator intervention is required
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Swap(e) if e.is_critical())
    }

    /// Whether the failure left the supervisor without a running server
    pub fn leaves_server_down(&self) -> bool {
        matches!(self, Self::Restart(_) | Self::Swap(SwapError::StopFailed(_))) || self.is_critical()
    }
}
