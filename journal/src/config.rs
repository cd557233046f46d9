use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde_derive::Deserialize;

use crate::error::{JournalError, Result};

/// Identity of one journal node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Exclusive directory for this node's journal state.
    pub storage_path: PathBuf,
    /// Name used in diagnostics, e.g. "master", "follower0".
    pub label: String,
    /// host:port the replication endpoint binds to.
    pub self_addr: String,
    /// host:port of an existing member, or `self_addr` to bootstrap.
    pub helper_addr: String,
    /// false makes this node an observer.
    #[serde(default = "default_can_vote")]
    pub can_vote: bool,
}

fn default_can_vote() -> bool {
    true
}

impl NodeConfig {
    pub fn new(
        storage_path: impl Into<PathBuf>,
        label: impl Into<String>,
        self_addr: impl Into<String>,
        helper_addr: impl Into<String>,
        can_vote: bool,
    ) -> Self {
        NodeConfig {
            storage_path: storage_path.into(),
            label: label.into(),
            self_addr: self_addr.into(),
            helper_addr: helper_addr.into(),
            can_vote,
        }
    }

    pub fn is_bootstrap_helper(&self) -> bool {
        self.helper_addr == self.self_addr
    }

    pub fn validate(&self) -> Result<()> {
        for addr in [&self.self_addr, &self.helper_addr] {
            let valid = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(JournalError::Config(format!(
                    "{} is not a host:port address",
                    addr
                )));
            }
        }
        if self.label.is_empty() {
            return Err(JournalError::Config("node label is empty".to_string()));
        }
        Ok(())
    }
}

/// Operational tunables, fixed for the lifetime of an environment.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JournalConfig {
    /// Attempts for binding and for reaching the helper.
    pub retry_time: u32,
    /// Pause between attempts; 0 retries immediately.
    pub sleep_interval_sec: u64,
    pub sync_timeout_sec: u64,
    /// How long a restarting member waits for the group to show a leader.
    pub leader_wait_sec: u64,
    pub propose_timeout_sec: u64,
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            retry_time: 3,
            sleep_interval_sec: 5,
            sync_timeout_sec: 30,
            leader_wait_sec: 10,
            propose_timeout_sec: 10,
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
        }
    }
}

impl JournalConfig {
    /// Deterministic, fast retries.
    pub fn for_test() -> Self {
        JournalConfig {
            retry_time: 3,
            sleep_interval_sec: 0,
            ..Default::default()
        }
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_sec)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_sec)
    }

    pub fn leader_wait(&self) -> Duration {
        Duration::from_secs(self.leader_wait_sec)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_secs(self.propose_timeout_sec)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Retries always make at least one attempt.
    pub fn attempts(&self) -> u32 {
        self.retry_time.max(1)
    }
}

/// Everything the `journal-node` binary reads from its config file.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    pub metrics_addr: Option<String>,
}

impl ServerConfig {
    pub fn from_toml(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            warn!("Something went wrong reading the config file {}, {:?}", path, e);
            JournalError::Config(format!("cannot read {}: {}", path, e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(contents)
            .map_err(|e| JournalError::Config(format!("invalid config: {}", e)))?;
        config.node.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = ServerConfig::parse(
            r#"
            [node]
            storage_path = "/var/lib/journal"
            label = "follower0"
            self_addr = "127.0.0.1:9011"
            helper_addr = "127.0.0.1:9010"
            "#,
        )
        .unwrap();
        assert!(config.node.can_vote);
        assert!(!config.node.is_bootstrap_helper());
        assert_eq!(config.journal.retry_time, 3);
        assert_eq!(config.journal.sleep_interval_sec, 5);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let config = ServerConfig::parse(
            r#"
            metrics_addr = "0.0.0.0:4010"

            [node]
            storage_path = "/tmp/observer"
            label = "observer"
            self_addr = "127.0.0.1:9013"
            helper_addr = "127.0.0.1:9010"
            can_vote = false

            [journal]
            retry_time = 5
            sleep_interval_sec = 0
            "#,
        )
        .unwrap();
        assert!(!config.node.can_vote);
        assert_eq!(config.journal.retry_time, 5);
        assert_eq!(config.journal.sleep_interval(), Duration::ZERO);
        assert_eq!(config.journal.election_tick, 10);
        assert_eq!(config.metrics_addr.as_deref(), Some("0.0.0.0:4010"));
    }

    #[test]
    fn test_rejects_bad_address() {
        let node = NodeConfig::new("/tmp/x", "master", "localhost", "localhost", true);
        assert!(matches!(node.validate(), Err(JournalError::Config(_))));
        let node = NodeConfig::new("/tmp/x", "master", "127.0.0.1:99999", "127.0.0.1:1", true);
        assert!(node.validate().is_err());
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let config = JournalConfig {
            retry_time: 0,
            ..JournalConfig::for_test()
        };
        assert_eq!(config.attempts(), 1);
    }
}
