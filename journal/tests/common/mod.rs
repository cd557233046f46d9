//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use journal::{JournalConfig, JournalEnvironment, NodeConfig};
use rand::RngCore;

/// How long replication gets before a test gives up.
pub const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn free_addr() -> String {
    format!("127.0.0.1:{}", pick_free_port().expect("no free port"))
}

/// 16 random bytes.
pub fn random_entry() -> Vec<u8> {
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Fast retries and a short leader wait.
pub fn test_config() -> JournalConfig {
    JournalConfig {
        leader_wait_sec: 10,
        sync_timeout_sec: 20,
        ..JournalConfig::for_test()
    }
}

pub fn environment(
    path: &Path,
    label: &str,
    self_addr: &str,
    helper_addr: &str,
    can_vote: bool,
) -> JournalEnvironment {
    JournalEnvironment::new(
        NodeConfig::new(path, label, self_addr, helper_addr, can_vote),
        test_config(),
    )
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Copies a directory tree, used to take and restore storage backups.
pub fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if let Err(e) = std::fs::copy(entry.path(), target) {
            // a temp file renamed away mid-copy
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e);
            }
        }
    }
    Ok(())
}
