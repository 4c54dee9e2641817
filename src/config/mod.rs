//! Configuration management for the index supervisor
//!
//! This module handles loading and validating configuration from TOML files
//! and environment variables, and exposes the fixed on-disk layout under the
//! data root.

use crate::utils::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the data root holding the live dataset
const DATASET_DIR: &str = "index";

/// Directory under the data root used for downloads and extraction
const TMP_DIR: &str = "tmp";

/// Latest remote checksum
const LATEST_TOKEN_FILE: &str = "latest.md5";

/// Checksum of the dataset the server was last started with
const STARTED_TOKEN_FILE: &str = "started.md5";

/// Persisted server pid
const PID_FILE: &str = "server.pid";

/// Prometheus textfile
const METRICS_FILE: &str = "metrics.prom";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem layout
    pub paths: PathsConfig,

    /// Remote archive endpoint
    pub remote: RemoteConfig,

    /// Supervised server process
    pub server: ServerConfig,

    /// Update scheduling and dataset structure
    pub update: UpdateConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Filesystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which every supervisor path lives
    pub data_root: PathBuf,
}

/// Remote archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// URL of the compressed dataset archive
    pub archive_url: String,

    /// Suffix appended to `archive_url` to reach the checksum resource
    pub checksum_suffix: String,

    /// Minimum free bytes required on the destination filesystem
    pub min_free_space_bytes: u64,

    /// Retry policy for the archive download
    pub download_retry: RetryPolicy,

    /// Retry policy for the checksum lookup
    pub checksum_retry: RetryPolicy,

    /// User agent string
    pub user_agent: String,
}

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable
    pub program: PathBuf,

    /// Seconds to wait after launch before checking the server is still alive
    pub startup_check_secs: u64,

    /// Seconds between graceful and forceful termination
    pub stop_grace_secs: u64,

    /// Seconds between foreground liveness polls
    pub poll_interval_secs: u64,
}

/// Update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Delay between server startup and the start of a background update
    pub settle_delay_secs: u64,

    /// Seconds between remote version checks while serving (0 disables)
    pub check_interval_secs: u64,

    /// Seconds a cancelled update task gets before it is aborted
    pub cancel_grace_secs: u64,

    /// Prefix shared by node directories inside an archive
    pub node_dir_prefix: String,

    /// Name of the live node directory inside the dataset root
    pub node_dir_name: String,

    /// Maximum depth searched for the node directory inside a candidate
    pub search_depth: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            archive_url: String::new(),
            checksum_suffix: String::from(".md5"),
            min_free_space_bytes: 200 * 1024 * 1024 * 1024,
            download_retry: RetryPolicy::exponential(5, 10_000, 300_000)
                .with_attempt_timeout(Duration::from_secs(2 * 60 * 60)),
            checksum_retry: RetryPolicy::fixed(3, 2_000)
                .with_attempt_timeout(Duration::from_secs(30)),
            user_agent: format!("index-supervisor/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/local/bin/search-server"),
            startup_check_secs: 5,
            stop_grace_secs: 60,
            poll_interval_secs: 1,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 60,
            check_interval_secs: 24 * 60 * 60,
            cancel_grace_secs: 30,
            node_dir_prefix: String::from("node_"),
            node_dir_name: String::from("node_1"),
            search_depth: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override fields from `INDEX_SUPERVISOR_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("INDEX_SUPERVISOR_DATA_ROOT") {
            self.paths.data_root = PathBuf::from(root);
        }
        if let Ok(url) = std::env::var("INDEX_SUPERVISOR_ARCHIVE_URL") {
            self.remote.archive_url = url;
        }
        if let Ok(suffix) = std::env::var("INDEX_SUPERVISOR_CHECKSUM_SUFFIX") {
            self.remote.checksum_suffix = suffix;
        }
        if let Ok(program) = std::env::var("INDEX_SUPERVISOR_SERVER_BIN") {
            self.server.program = PathBuf::from(program);
        }
        if let Some(bytes) = env_parse("INDEX_SUPERVISOR_MIN_FREE_SPACE")? {
            self.remote.min_free_space_bytes = bytes;
        }
        if let Some(secs) = env_parse("INDEX_SUPERVISOR_STOP_GRACE")? {
            self.server.stop_grace_secs = secs;
        }
        if let Some(secs) = env_parse("INDEX_SUPERVISOR_SETTLE_DELAY")? {
            self.update.settle_delay_secs = secs;
        }
        if let Some(secs) = env_parse("INDEX_SUPERVISOR_CHECK_INTERVAL")? {
            self.update.check_interval_secs = secs;
        }
        if let Ok(level) = std::env::var("INDEX_SUPERVISOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("INDEX_SUPERVISOR_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.remote.archive_url)
            .with_context(|| format!("Invalid archive_url: {:?}", self.remote.archive_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("archive_url must be http(s), got {}", url.scheme());
        }

        if self.server.program.as_os_str().is_empty() {
            anyhow::bail!("server.program must not be empty");
        }

        if self.remote.download_retry.max_attempts == 0
            || self.remote.checksum_retry.max_attempts == 0
        {
            anyhow::bail!("retry max_attempts must be greater than 0");
        }

        if self.update.node_dir_prefix.is_empty()
            || !self
                .update
                .node_dir_name
                .starts_with(&self.update.node_dir_prefix)
        {
            anyhow::bail!(
                "node_dir_name {:?} must start with node_dir_prefix {:?}",
                self.update.node_dir_name,
                self.update.node_dir_prefix
            );
        }

        if self.update.search_depth == 0 {
            anyhow::bail!("search_depth must be greater than 0");
        }

        if self.server.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }

        Ok(())
    }

    /// Paths derived from the data root
    #[must_use]
    pub fn layout(&self) -> DataLayout {
        DataLayout {
            root: self.paths.data_root.clone(),
            node_dir_name: self.update.node_dir_name.clone(),
        }
    }

    /// URL of the checksum resource next to the archive
    #[must_use]
    pub fn checksum_url(&self) -> String {
        format!("{}{}", self.remote.archive_url, self.remote.checksum_suffix)
    }

    #[must_use]
    pub fn startup_check(&self) -> Duration {
        Duration::from_secs(self.server.startup_check_secs)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.server.stop_grace_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.server.poll_interval_secs)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.update.settle_delay_secs)
    }

    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.update.cancel_grace_secs)
    }

    /// Periodic check interval, `None` when disabled
    #[must_use]
    pub fn check_interval(&self) -> Option<Duration> {
        match self.update.check_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Fixed paths under one data root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
    node_dir_name: String,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>, node_dir_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            node_dir_name: node_dir_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the node directories
    pub fn dataset_root(&self) -> PathBuf {
        self.root.join(DATASET_DIR)
    }

    /// Live node directory the server reads
    pub fn live_node_dir(&self) -> PathBuf {
        self.dataset_root().join(&self.node_dir_name)
    }

    pub fn node_dir_name(&self) -> &str {
        &self.node_dir_name
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn latest_token_file(&self) -> PathBuf {
        self.root.join(LATEST_TOKEN_FILE)
    }

    pub fn started_token_file(&self) -> PathBuf {
        self.root.join(STARTED_TOKEN_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.root.join(METRICS_FILE)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{name}={raw:?} is invalid: {e}")),
        Err(_) => Ok(None),
    }
}
