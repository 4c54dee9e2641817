//! Persisted version tokens
//!
//! A version token is the 32-character hex digest published next to the
//! remote archive. Two of them are persisted: the latest remote value and the
//! value of the dataset the server was last started with. Anything read back
//! that is not a well-formed token is reported as absent.

use crate::utils::error::TokenError;
use regex::Regex;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

/// Hex digest identifying one dataset snapshot
///
/// Comparison ignores ASCII case; the original spelling is preserved for
/// persistence.
#[derive(Debug, Clone, Eq)]
pub struct VersionToken(String);

impl VersionToken {
    /// Length of a token in characters
    pub const LEN: usize = 32;

    /// Validate and wrap a token
    pub fn parse(value: &str) -> Result<Self, TokenError> {
        if token_pattern().is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(TokenError::Invalid(value.to_string()))
        }
    }

    /// Extract the token from a checksum document
    ///
    /// Only the first whitespace-delimited field is considered, as in
    /// `md5sum` output (`<digest>  <filename>`).
    pub fn from_checksum_document(body: &str) -> Result<Self, TokenError> {
        let first = body.split_whitespace().next().unwrap_or_default();
        Self::parse(first)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for VersionToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn token_pattern() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{32}$").expect("Invalid regex pattern"))
}

/// Read a token from `path`
///
/// Missing, unreadable, empty and malformed files all yield `None`.
pub fn read_token(path: &Path) -> Option<VersionToken> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read token file");
            }
            return None;
        }
    };

    // Only trailing whitespace, such as the newline `write_token` adds
    let text = std::str::from_utf8(&bytes).ok()?.trim_end();
    match VersionToken::parse(text) {
        Ok(token) => Some(token),
        Err(_) => {
            if !text.is_empty() {
                tracing::warn!(path = %path.display(), "Ignoring malformed token file");
            }
            None
        }
    }
}

/// Persist a token to `path`
///
/// The value is written to a sibling temp file first and renamed over the
/// destination, so a reader never observes a partial token.
pub fn write_token(path: &Path, token: &VersionToken) -> Result<(), TokenError> {
    let write_err = |source| TokenError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let temp_path = temp_path_for(path);
    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    writeln!(file, "{}", token.as_str()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(write_err(e));
    }

    tracing::debug!(path = %path.display(), token = %token, "Token saved");
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// The two persisted tokens of one data root
#[derive(Debug, Clone)]
pub struct TokenStore {
    latest: PathBuf,
    started: PathBuf,
}

impl TokenStore {
    pub fn new(latest: impl Into<PathBuf>, started: impl Into<PathBuf>) -> Self {
        Self {
            latest: latest.into(),
            started: started.into(),
        }
    }

    /// Latest token fetched from the remote
    pub fn latest(&self) -> Option<VersionToken> {
        read_token(&self.latest)
    }

    /// Token of the dataset the server was last started with
    pub fn started(&self) -> Option<VersionToken> {
        read_token(&self.started)
    }

    pub fn save_latest(&self, token: &VersionToken) -> Result<(), TokenError> {
        write_token(&self.latest, token)
    }

    pub fn save_started(&self, token: &VersionToken) -> Result<(), TokenError> {
        write_token(&self.started, token)
    }
}
