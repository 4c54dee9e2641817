//! Unified error handling for the index-supervisor crate
//!
//! This module provides a unified error type that consolidates the
//! component errors into a single `Error` enum, while keeping the
//! component errors available for callers that match on them.
//!
//! # Architecture
//!
//! - [`SupervisorErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all component errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use index_supervisor::error::{Error, SupervisorErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_critical() {
//!         eprintln!("{err}");
//!     } else if err.is_recoverable() {
//!         println!("Will retry on next check: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::utils::error::{FetchError, ProcessError, SwapError, TokenError, UpdateError};

/// Common trait for all supervisor error types
pub trait SupervisorErrorTrait: std::error::Error {
    /// Check if this error is recoverable (a later attempt may succeed)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, checksum retrieval)
    Network,
    /// Storage and I/O errors (disk space, extraction, token files)
    Storage,
    /// Dataset structure and swap errors
    Dataset,
    /// Child process lifecycle errors
    Process,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Dataset => "dataset",
            Self::Process => "process",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the index-supervisor crate
#[derive(Error, Debug)]
pub enum Error {
    /// Checksum store errors
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Archive fetcher errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Dataset swapper errors
    #[error("Swap error: {0}")]
    Swap(#[from] SwapError),

    /// Process supervisor errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Background update errors
    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SupervisorErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Token(_) => true,
            Self::Fetch(e) => !matches!(e, FetchError::InsufficientSpace { .. }),
            Self::Swap(e) => !e.is_critical(),
            Self::Process(e) => matches!(e, ProcessError::Io(_)),
            Self::Update(e) => !e.is_critical() && !e.leaves_server_down(),
            Self::Io(_) => true,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Token(_) => ErrorCategory::Storage,
            Self::Fetch(e) => match e {
                FetchError::InsufficientSpace { .. }
                | FetchError::ExtractionFailure(_)
                | FetchError::Io(_) => ErrorCategory::Storage,
                _ => ErrorCategory::Network,
            },
            Self::Swap(_) => ErrorCategory::Dataset,
            Self::Process(_) => ErrorCategory::Process,
            Self::Update(e) => match e {
                UpdateError::Fetch(_) => ErrorCategory::Network,
                UpdateError::Swap(_) => ErrorCategory::Dataset,
                _ => ErrorCategory::Process,
            },
            Self::Http(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True only for a failed restore after a failed swap
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Swap(e) => e.is_critical(),
            Self::Update(e) => e.is_critical(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
