//! Common test utilities for `Tether` integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tether_core::config::SessionConfig;
use tether_core::connection::ConnectionConfig;
use tether_core::transfer::TransferInfo;
use tokio::sync::watch;

/// Base port for tests, incremented for each test to avoid conflicts.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(53600);

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Get a pair of unique ports for a test.
pub fn get_test_ports() -> (u16, u16) {
    let base = TEST_PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

/// Session settings writing into `download_dir`, with a short dial backoff.
pub fn session_config(download_dir: &Path) -> SessionConfig {
    SessionConfig {
        dial_backoff: Duration::from_millis(20),
        download_dir: download_dir.to_path_buf(),
        ..SessionConfig::default()
    }
}

/// Loopback connection settings.
pub fn loopback(local_port: u16, remote_port: u16, peer_known: bool) -> ConnectionConfig {
    ConnectionConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        local_port,
        remote_port,
        remote_address: peer_known.then_some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        dial_backoff: Duration::from_millis(20),
        ..ConnectionConfig::default()
    }
}

/// Wait for a transfer to reach a terminal state.
pub async fn wait_finished(mut progress: watch::Receiver<TransferInfo>) -> TransferInfo {
    let info = tokio::time::timeout(
        Duration::from_secs(15),
        progress.wait_for(TransferInfo::is_finished),
    )
    .await
    .expect("transfer did not finish in time")
    .expect("progress channel closed")
    .clone();
    info
}
