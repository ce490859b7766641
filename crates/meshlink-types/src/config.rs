//! MeshLink configuration.
//!
//! Every field has a default so a partial (or empty) TOML file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default loopback port the agent binds its request/reply socket on.
pub const DEFAULT_AGENT_PORT: u16 = 5555;

/// Name of the MeshLink home directory under the user's home.
pub const HOME_DIR_NAME: &str = ".meshlink";

/// Restart policy for the supervised agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Relaunches allowed before the supervisor gives up.
    pub max_restarts: u32,
    /// Backoff before the first relaunch, in milliseconds.
    pub min_delay_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = none).
    pub jitter: f64,
    /// Uptime after which the restart counter resets.
    pub stable_after_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            min_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter: 0.2,
            stable_after_secs: 30,
        }
    }
}

/// Top-level MeshLink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshLinkConfig {
    /// Install directory; the agent binary lives in `<install_dir>/go/`.
    pub install_dir: PathBuf,
    /// Host the agent listens on.
    pub agent_host: String,
    /// Port the agent listens on.
    pub agent_port: u16,
    /// Extra arguments passed to the agent.
    pub agent_args: Vec<String>,
    /// Extra environment for the agent process.
    pub agent_env: BTreeMap<String, String>,
    /// Relaunch the agent when it exits unexpectedly.
    pub restart_on_failure: bool,
    pub restart: RestartPolicy,
    /// Time the agent gets to exit after SIGTERM before it is killed.
    pub shutdown_grace_ms: u64,
    /// How long to wait for the agent to accept connections after launch.
    pub startup_timeout_ms: u64,
    /// Delay between connection attempts during startup.
    pub startup_poll_ms: u64,
}

impl Default for MeshLinkConfig {
    fn default() -> Self {
        Self {
            install_dir: default_home_dir(),
            agent_host: "127.0.0.1".to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            agent_args: Vec::new(),
            agent_env: BTreeMap::new(),
            restart_on_failure: true,
            restart: RestartPolicy::default(),
            shutdown_grace_ms: 3_000,
            startup_timeout_ms: 10_000,
            startup_poll_ms: 100,
        }
    }
}

impl MeshLinkConfig {
    /// ZeroMQ endpoint of the agent's REP socket.
    pub fn agent_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.agent_host, self.agent_port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms.max(1))
    }
}

/// `~/.meshlink`, or `./.meshlink` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(HOME_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshLinkConfig::default();
        assert_eq!(config.agent_port, 5555);
        assert_eq!(config.agent_endpoint(), "tcp://127.0.0.1:5555");
        assert!(config.restart_on_failure);
        assert_eq!(config.restart.max_restarts, 5);
        assert!(config.install_dir.ends_with(HOME_DIR_NAME));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: MeshLinkConfig = toml::from_str(
            r#"
            agent_port = 6000
            [restart]
            max_restarts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.agent_port, 6000);
        assert_eq!(config.restart.max_restarts, 2);
        assert_eq!(config.restart.min_delay_ms, 250);
        assert_eq!(config.startup_timeout_ms, 10_000);
    }

    #[test]
    fn test_poll_never_zero() {
        let config = MeshLinkConfig {
            startup_poll_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.startup_poll(), Duration::from_millis(1));
    }
}
