//! Remote archive fetcher
//!
//! This module downloads the dataset archive and its checksum with features
//! including:
//! - A free-space precondition checked before any network I/O
//! - Download to a single file, then extraction, so a failed transfer is
//!   retried without re-extracting
//! - Independent retry policies for the archive and the checksum
//! - Removal of every partial artifact when a fetch fails

pub mod extract;
pub mod space;

use crate::config::Config;
use crate::storage::VersionToken;
use crate::utils::error::FetchError;
use crate::utils::format_bytes;
use crate::utils::retry::{with_retry_if, RetryPolicy};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Name of the in-progress download inside the destination
const DOWNLOAD_FILE_NAME: &str = ".dataset.archive.part";

/// Downloads and extracts the remote dataset archive
pub struct ArchiveFetcher {
    /// Client for the archive, timeout = download attempt timeout
    archive_client: Client,

    /// Client for the checksum, timeout = checksum attempt timeout
    checksum_client: Client,

    archive_url: String,
    checksum_url: String,
    download_retry: RetryPolicy,
    checksum_retry: RetryPolicy,

    /// Minimum free bytes required before a download starts
    min_free_space: u64,
}

impl ArchiveFetcher {
    /// Create a fetcher from configuration
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if an HTTP client cannot be created
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let remote = &config.remote;
        let headers = default_headers(&remote.user_agent);

        let archive_client = Client::builder()
            .timeout(remote.download_retry.attempt_timeout())
            .default_headers(headers.clone())
            .build()?;

        let checksum_client = Client::builder()
            .timeout(remote.checksum_retry.attempt_timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            archive_client,
            checksum_client,
            archive_url: remote.archive_url.clone(),
            checksum_url: config.checksum_url(),
            download_retry: remote.download_retry.clone(),
            checksum_retry: remote.checksum_retry.clone(),
            min_free_space: remote.min_free_space_bytes,
        })
    }

    pub fn archive_url(&self) -> &str {
        &self.archive_url
    }

    /// Fetch the archive and extract it into `destination`
    ///
    /// A `temporary` destination is owned entirely by this call: it is
    /// emptied first and removed as a whole on failure. Otherwise only the
    /// entries created by this call are removed on failure.
    ///
    /// # Errors
    ///
    /// `InsufficientSpace` (no network I/O performed), `DownloadFailure`
    /// after the retry policy is exhausted, or `ExtractionFailure`.
    pub async fn fetch(&self, destination: &Path, temporary: bool) -> Result<PathBuf, FetchError> {
        if temporary && destination.exists() {
            tracing::info!(path = %destination.display(), "Removing stale temporary directory");
            tokio::fs::remove_dir_all(destination).await?;
        }

        space::ensure_free_space(destination, self.min_free_space)?;

        let created = !destination.exists();
        tokio::fs::create_dir_all(destination).await?;
        let before = if temporary || created {
            HashSet::new()
        } else {
            list_entries(destination)?
        };

        let cleanup = Cleanup {
            destination: destination.to_path_buf(),
            remove_all: temporary || created,
            before,
        };

        let archive_path = destination.join(DOWNLOAD_FILE_NAME);
        let bytes = match self.download(&archive_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                cleanup.run().await;
                return Err(e);
            }
        };

        tracing::info!(
            url = %self.archive_url,
            size = %format_bytes(bytes),
            "Archive downloaded"
        );

        let unpack_archive = archive_path.clone();
        let unpack_dest = destination.to_path_buf();
        let extracted =
            tokio::task::spawn_blocking(move || extract::unpack(&unpack_archive, &unpack_dest))
                .await
                .map_err(|e| FetchError::ExtractionFailure(format!("extraction task failed: {e}")))
                .and_then(|result| result);

        if let Err(e) = extracted {
            cleanup.run().await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            tracing::warn!(path = %archive_path.display(), error = %e, "Failed to remove archive after extraction");
        }

        tracing::info!(path = %destination.display(), "Archive extracted");
        Ok(destination.to_path_buf())
    }

    /// Download the archive to `file` under the download retry policy
    async fn download(&self, file: &Path) -> Result<u64, FetchError> {
        with_retry_if(
            &self.download_retry,
            || self.download_once(file),
            FetchError::is_transient,
        )
        .await
        .map_err(|exhausted| FetchError::DownloadFailure {
            attempts: exhausted.attempts,
            reason: exhausted.last_error.to_string(),
        })
    }

    /// A single download attempt, truncating any previous partial file
    async fn download_once(&self, file: &Path) -> Result<u64, FetchError> {
        tracing::info!(url = %self.archive_url, "Downloading archive");

        let mut response = self
            .archive_client
            .get(&self.archive_url)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServerError(status.as_u16()));
        }

        let mut out = tokio::fs::File::create(file).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;

        Ok(written)
    }

    /// Fetch the remote version token from the configured checksum URL
    pub async fn fetch_version_token(&self) -> Result<VersionToken, FetchError> {
        self.fetch_version_token_from(&self.checksum_url).await
    }

    /// Fetch a version token from `url` under the checksum retry policy
    ///
    /// Callers treat failure as "version unknown", never as fatal.
    pub async fn fetch_version_token_from(&self, url: &str) -> Result<VersionToken, FetchError> {
        let body = with_retry_if(
            &self.checksum_retry,
            || self.fetch_text(url),
            FetchError::is_transient,
        )
        .await
        .map_err(|exhausted| FetchError::ChecksumUnavailable(exhausted.to_string()))?;

        VersionToken::from_checksum_document(&body)
            .map_err(|e| FetchError::ChecksumUnavailable(format!("{url}: {e}")))
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.checksum_client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServerError(status.as_u16()));
        }

        response.text().await.map_err(classify)
    }
}

fn default_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_builder() {
        FetchError::InvalidUrl(err.to_string())
    } else {
        FetchError::Http(err)
    }
}

fn list_entries(dir: &Path) -> std::io::Result<HashSet<OsString>> {
    std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect()
}

/// Undo the filesystem effects of a failed fetch
struct Cleanup {
    destination: PathBuf,
    remove_all: bool,
    before: HashSet<OsString>,
}

impl Cleanup {
    async fn run(&self) {
        if self.remove_all {
            if let Err(e) = tokio::fs::remove_dir_all(&self.destination).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.destination.display(), error = %e, "Failed to remove partial download");
                }
            }
            return;
        }

        let entries = match list_entries(&self.destination) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.destination.display(), error = %e, "Failed to list destination for cleanup");
                return;
            }
        };

        for name in entries.difference(&self.before) {
            let path = self.destination.join(name);
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
            }
        }
    }
}
