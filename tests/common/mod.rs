//! Shared fixtures for integration tests

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use index_supervisor::config::Config;
use index_supervisor::utils::retry::RetryPolicy;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_A: &str = "0123456789abcdef0123456789abcdef";
pub const TOKEN_B: &str = "fedcba9876543210fedcba9876543210";

pub const ARCHIVE_PATH: &str = "/dump/index.tar.gz";
pub const CHECKSUM_PATH: &str = "/dump/index.tar.gz.md5";

/// Build a gzip-compressed tar holding `files` (relative path, contents)
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Configuration pointing at `server` with fast retries and no free-space floor
pub fn test_config(data_root: &Path, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.paths.data_root = data_root.to_path_buf();
    config.remote.archive_url = format!("{}{ARCHIVE_PATH}", server.uri());
    config.remote.min_free_space_bytes = 0;
    config.remote.download_retry =
        RetryPolicy::fixed(3, 10).with_attempt_timeout(Duration::from_secs(10));
    config.remote.checksum_retry =
        RetryPolicy::fixed(2, 10).with_attempt_timeout(Duration::from_secs(5));
    config.server.program = "/bin/sleep".into();
    config.server.startup_check_secs = 0;
    config.server.stop_grace_secs = 5;
    config.update.settle_delay_secs = 0;
    config.update.check_interval_secs = 0;
    config.update.cancel_grace_secs = 1;
    config
}

pub async fn mount_archive(server: &MockServer, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

pub async fn mount_checksum(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path(CHECKSUM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{token}  index.tar.gz\n")))
        .mount(server)
        .await;
}

/// Write `contents` into `<dir>/segment.dat`, creating `dir`
pub fn populate(dir: &Path, contents: &[u8]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("segment.dat"), contents).unwrap();
}
