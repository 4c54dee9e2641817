//! index-supervisor - Search-index server supervisor with hot dataset swaps
//!
//! Keeps a search server running on a large dataset fetched from a remote
//! archive, and replaces that dataset with newer snapshots while the server
//! keeps serving.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and the data-root layout
//! - [`storage`] - Persisted version tokens
//! - [`fetcher`] - Archive download, extraction and free-space checks
//! - [`dataset`] - Dataset validity and the hot swap with rollback
//! - [`process`] - Server child process supervision
//! - [`orchestrator`] - Startup decisions and background updates
//! - [`shutdown`] - Signal handling and ordered teardown
//! - [`metrics`] - Prometheus metrics textfile
//! - [`utils`] - Retry policies and common helpers
//!
//! # Example
//!
//! ```no_run
//! use index_supervisor::config::Config;
//! use index_supervisor::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let orchestrator = Orchestrator::new(config, Vec::new())?;
//!     let code = orchestrator.run(index_supervisor::shutdown::wait_for_signal()).await;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod shutdown;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, DataLayout};
    pub use crate::dataset::{DatasetSwapper, ServerControl};
    pub use crate::error::{Error, ErrorCategory, Result, SupervisorErrorTrait};
    pub use crate::fetcher::ArchiveFetcher;
    pub use crate::orchestrator::{IndexState, Orchestrator};
    pub use crate::process::{ProcessSupervisor, ServerStatus};
    pub use crate::shutdown::ShutdownCoordinator;
    pub use crate::storage::{TokenStore, VersionToken};
    pub use crate::utils::retry::{BackoffStrategy, RetryPolicy};
}
