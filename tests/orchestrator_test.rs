//! End-to-end orchestrator scenarios against a wiremock archive endpoint
//!
//! `/bin/sleep` stands in for the search server.

#![cfg(unix)]

mod common;

use common::*;
use index_supervisor::config::Config;
use index_supervisor::dataset::{is_valid_dataset, list_backups};
use index_supervisor::error::{SwapError, UpdateError};
use index_supervisor::orchestrator::{IndexState, Orchestrator, EXIT_FAILURE, EXIT_OK};
use index_supervisor::process::{is_running, pidfile, ServerStatus};
use index_supervisor::storage::{write_token, VersionToken};
use index_supervisor::utils::retry::RetryPolicy;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::new(config, vec!["30".into()]).unwrap()
}

async fn server_pid(orch: &Orchestrator) -> i32 {
    match orch.supervisor().lock().await.status().unwrap() {
        ServerStatus::Running(pid) => pid,
        other => panic!("expected running server, got {other:?}"),
    }
}

/// Live dataset `old` started with token A
fn seed_dataset(config: &Config) {
    let layout = config.layout();
    populate(&layout.live_node_dir(), b"old");
    write_token(&layout.started_token_file(), &VersionToken::parse(TOKEN_A).unwrap()).unwrap();
}

#[tokio::test]
async fn test_initial_fetch_installs_dataset_and_starts_server() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;
    mount_archive(&server, tar_gz(&[("export/node_1/segment.dat", b"fresh")])).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    let state = orch.startup().await.unwrap();

    assert_eq!(state, IndexState::IndexCurrent);
    assert!(!orch.update_in_flight());
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"fresh");
    assert!(!layout.dataset_root().join("export").exists());
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_A);
    assert_eq!(orch.tokens().latest().unwrap().as_str(), TOKEN_A);

    let pid = server_pid(&orch).await;
    assert_eq!(pidfile::read_pid(&layout.pid_file()), Some(pid));

    orch.shutdown().await.unwrap();
    assert!(!is_running(pid));
    assert_eq!(pidfile::read_pid(&layout.pid_file()), None);
}

#[tokio::test]
async fn test_equal_tokens_start_without_update() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::IndexCurrent);
    assert!(!orch.update_in_flight());
    server_pid(&orch).await;

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checksum_unavailable_serves_existing_dataset() {
    let server = MockServer::start().await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::IndexCurrent);
    assert!(!orch.update_in_flight());
    assert!(orch.tokens().latest().is_none());

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_dataset_serves_immediately_then_swaps() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz(&[("node_1/segment.dat", b"new")])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::UpdateInFlight);
    let first_pid = server_pid(&orch).await;

    let outcome = orch.wait_for_update().await.expect("an update was in flight");
    assert_eq!(outcome.unwrap().as_str(), TOKEN_B);

    assert_eq!(orch.state(), IndexState::IndexCurrent);
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"new");
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_B);
    assert!(list_backups(&layout.live_node_dir()).unwrap().is_empty());
    assert!(!layout.tmp_dir().exists());

    let second_pid = server_pid(&orch).await;
    assert_ne!(first_pid, second_pid);
    assert!(!is_running(first_pid));

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_candidate_without_node_dir_leaves_server_untouched() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    mount_archive(&server, tar_gz(&[("docs/README", b"no dataset here")])).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    orch.startup().await.unwrap();
    let pid = server_pid(&orch).await;

    let outcome = orch.wait_for_update().await.unwrap();
    assert!(matches!(
        outcome,
        Err(UpdateError::Swap(SwapError::InvalidCandidateStructure(_)))
    ));

    assert_eq!(orch.state(), IndexState::IndexStale);
    assert!(is_valid_dataset(&layout.live_node_dir()));
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"old");
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_A);
    assert!(!layout.tmp_dir().exists());
    assert_eq!(server_pid(&orch).await, pid);

    orch.shutdown().await.unwrap();
}

/// Server that removes `$0` when asked to stop, so the candidate vanishes
/// after the swap has stopped it
const DELETE_ON_TERM: &str = r#"trap 'rm -rf "$0"; exit 0' TERM; while :; do sleep 0.2; done"#;

#[tokio::test]
async fn test_swap_failure_after_stop_restores_and_restarts() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    mount_archive(&server, tar_gz(&[("node_1/segment.dat", b"new")])).await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &server);
    config.server.program = "/bin/sh".into();
    seed_dataset(&config);
    let layout = config.layout();
    let candidate = layout.tmp_dir().join("node_1");

    let mut orch = Orchestrator::new(
        config,
        vec!["-c".into(), DELETE_ON_TERM.into(), candidate.into_os_string()],
    )
    .unwrap();

    assert_eq!(orch.startup().await.unwrap(), IndexState::UpdateInFlight);
    let first_pid = server_pid(&orch).await;

    let outcome = orch.wait_for_update().await.unwrap();
    assert!(matches!(
        outcome,
        Err(UpdateError::Swap(SwapError::InvalidCandidateStructure(_)))
    ));

    assert_eq!(orch.state(), IndexState::IndexStale);
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"old");
    assert!(list_backups(&layout.live_node_dir()).unwrap().is_empty());
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_A);

    let second_pid = server_pid(&orch).await;
    assert_ne!(first_pid, second_pid);
    assert!(!is_running(first_pid));
    assert_eq!(pidfile::read_pid(&layout.pid_file()), Some(second_pid));

    orch.shutdown().await.unwrap();
    assert!(!is_running(second_pid));
}

#[tokio::test]
async fn test_failed_download_is_contained() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    orch.startup().await.unwrap();
    let pid = server_pid(&orch).await;

    let outcome = orch.wait_for_update().await.unwrap();
    assert!(matches!(outcome, Err(UpdateError::Fetch(_))));
    assert!(!layout.tmp_dir().exists());
    assert_eq!(server_pid(&orch).await, pid);

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_update_during_settle() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &server);
    config.update.settle_delay_secs = 3600;
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::UpdateInFlight);
    let pid = server_pid(&orch).await;

    tokio::time::timeout(Duration::from_secs(10), orch.shutdown())
        .await
        .expect("shutdown must not wait for the settle delay")
        .unwrap();

    assert!(!orch.update_in_flight());
    assert!(!is_running(pid));
    assert!(!layout.tmp_dir().exists());
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_A);
}

#[tokio::test]
async fn test_shutdown_aborts_unresponsive_update() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_B).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &server);
    config.remote.download_retry =
        RetryPolicy::fixed(1, 10).with_attempt_timeout(Duration::from_secs(120));
    config.update.cancel_grace_secs = 1;
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::UpdateInFlight);
    let pid = server_pid(&orch).await;

    // Let the task get stuck in the download
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    orch.shutdown().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "shutdown returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "shutdown took {elapsed:?}");
    assert!(!orch.update_in_flight());
    assert!(!is_running(pid));
    assert!(!layout.tmp_dir().exists());
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"old");
    assert_eq!(orch.tokens().started().unwrap().as_str(), TOKEN_A);
}

#[tokio::test]
async fn test_periodic_check_launches_single_update() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &server);
    config.update.settle_delay_secs = 1;
    seed_dataset(&config);
    let layout = config.layout();
    let mut orch = orchestrator(config);

    assert_eq!(orch.startup().await.unwrap(), IndexState::IndexCurrent);
    assert!(!orch.update_in_flight());

    server.reset().await;
    mount_checksum(&server, TOKEN_B).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz(&[("node_1/segment.dat", b"new")])))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(orch.check_for_update().await, Some(IndexState::UpdateInFlight));
    assert_eq!(orch.tokens().latest().unwrap().as_str(), TOKEN_B);
    assert_eq!(orch.check_for_update().await, None);

    let outcome = orch.wait_for_update().await.expect("an update was in flight");
    assert_eq!(outcome.unwrap().as_str(), TOKEN_B);
    assert_eq!(std::fs::read(layout.live_node_dir().join("segment.dat")).unwrap(), b"new");

    assert_eq!(orch.check_for_update().await, Some(IndexState::IndexCurrent));
    assert!(!orch.update_in_flight());

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_exits_cleanly_on_shutdown() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    seed_dataset(&config);
    let layout = config.layout();

    let code = orchestrator(config)
        .run(tokio::time::sleep(Duration::from_millis(500)))
        .await;

    assert_eq!(code, EXIT_OK);
    assert_eq!(pidfile::read_pid(&layout.pid_file()), None);
}

#[tokio::test]
async fn test_run_fails_when_initial_fetch_fails() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let layout = config.layout();

    let code = orchestrator(config).run(std::future::pending()).await;

    assert_eq!(code, EXIT_FAILURE);
    assert!(!is_valid_dataset(&layout.live_node_dir()));
    assert_eq!(pidfile::read_pid(&layout.pid_file()), None);
}

#[tokio::test]
async fn test_run_reports_server_crash() {
    let server = MockServer::start().await;
    mount_checksum(&server, TOKEN_A).await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &server);
    config.server.program = "/bin/sh".into();
    seed_dataset(&config);

    let orch = Orchestrator::new(config, vec!["-c".into(), "sleep 1; exit 3".into()]).unwrap();
    let code = tokio::time::timeout(Duration::from_secs(20), orch.run(std::future::pending()))
        .await
        .expect("supervisor must notice the exit");

    assert_eq!(code, EXIT_FAILURE);
}
