//! Configuration loading from `~/.meshlink/config.toml` with defaults.
//!
//! A missing or unreadable file is not an error: the defaults are used and
//! a warning is logged. `MESHLINK_PORT` and `MESHLINK_HOME` override the
//! agent port and install directory after the file is applied.

use meshlink_types::config::default_home_dir;
use meshlink_types::MeshLinkConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding `agent_port`.
pub const PORT_ENV: &str = "MESHLINK_PORT";
/// Environment variable overriding `install_dir`.
pub const HOME_ENV: &str = "MESHLINK_HOME";

/// Load configuration from a TOML file, falling back to defaults, then
/// apply environment overrides.
pub fn load_config(path: Option<&Path>) -> MeshLinkConfig {
    let mut config = read_config_file(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Default config file location: `~/.meshlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    default_home_dir().join("config.toml")
}

fn read_config_file(path: Option<&Path>) -> MeshLinkConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MeshLinkConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<MeshLinkConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                MeshLinkConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            MeshLinkConfig::default()
        }
    }
}

/// Apply `MESHLINK_PORT` / `MESHLINK_HOME` from `lookup`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(config: &mut MeshLinkConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup(PORT_ENV) {
        match port.trim().parse::<u16>() {
            Ok(port) if port != 0 => config.agent_port = port,
            _ => warn!(value = %port, "Ignoring invalid {PORT_ENV}"),
        }
    }
    if let Some(home) = lookup(HOME_ENV) {
        if home.trim().is_empty() {
            warn!("Ignoring empty {HOME_ENV}");
        } else {
            config.install_dir = PathBuf::from(home);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_config_file(Some(&dir.path().join("nope.toml")));
        assert_eq!(config, MeshLinkConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            install_dir = "/opt/meshlink"
            agent_port = 7000
            agent_args = ["--verbose"]
            restart_on_failure = false

            [agent_env]
            CGO_ENABLED = "1"

            [restart]
            max_restarts = 9
            "#,
        )
        .unwrap();

        let config = read_config_file(Some(&path));
        assert_eq!(config.install_dir, PathBuf::from("/opt/meshlink"));
        assert_eq!(config.agent_port, 7000);
        assert_eq!(config.agent_args, vec!["--verbose".to_string()]);
        assert!(!config.restart_on_failure);
        assert_eq!(config.agent_env.get("CGO_ENABLED").map(String::as_str), Some("1"));
        assert_eq!(config.restart.max_restarts, 9);
        assert_eq!(config.restart.min_delay_ms, 250);
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "agent_port = \"not a port\"").unwrap();
        assert_eq!(read_config_file(Some(&path)), MeshLinkConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MeshLinkConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[(PORT_ENV, "6001"), (HOME_ENV, "/srv/meshlink")]),
        );
        assert_eq!(config.agent_port, 6001);
        assert_eq!(config.install_dir, PathBuf::from("/srv/meshlink"));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let mut config = MeshLinkConfig::default();
        apply_env_overrides(&mut config, env(&[(PORT_ENV, "port"), (HOME_ENV, "  ")]));
        assert_eq!(config, MeshLinkConfig::default());

        apply_env_overrides(&mut config, env(&[(PORT_ENV, "0")]));
        assert_eq!(config.agent_port, 5555);
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with(".meshlink/config.toml"));
    }
}
