use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn default_database_path() -> String {
    "xsha.sqlite".to_string()
}

fn default_workspace_base_dir() -> String {
    "/tmp/xsha-workspaces".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_scheduler_interval_secs() -> u64 {
    5
}

fn default_git_clone_timeout_secs() -> u64 {
    5 * 60
}

fn default_docker_execution_timeout_secs() -> u64 {
    120 * 60
}

/// Proxy environment injected into git subprocesses when enabled.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GitProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub http_proxy: String,
    #[serde(default)]
    pub https_proxy: String,
    #[serde(default)]
    pub no_proxy: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Root of the per-task workspace directories.
    #[serde(default = "default_workspace_base_dir")]
    pub workspace_base_dir: String,
    /// Global concurrency cap for the execution manager.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "default_git_clone_timeout_secs")]
    pub git_clone_timeout_secs: u64,
    #[serde(default = "default_docker_execution_timeout_secs")]
    pub docker_execution_timeout_secs: u64,
    /// When false, git subprocesses run with `GIT_SSL_NO_VERIFY=true`.
    #[serde(default)]
    pub git_ssl_verify: bool,
    #[serde(default)]
    pub git_proxy: GitProxyConfig,
    /// Process-wide key material for credential secret encryption.
    #[serde(default)]
    pub aes_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workspace_base_dir: default_workspace_base_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            git_clone_timeout_secs: default_git_clone_timeout_secs(),
            docker_execution_timeout_secs: default_docker_execution_timeout_secs(),
            git_ssl_verify: false,
            git_proxy: GitProxyConfig::default(),
            aes_key: String::new(),
        }
    }
}

impl Config {
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn git_clone_timeout(&self) -> Duration {
        Duration::from_secs(self.git_clone_timeout_secs)
    }

    pub fn docker_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_execution_timeout_secs)
    }
}

/// Always returns a config: falls back to defaults when the file is missing
/// or unreadable, and to per-field defaults for anything the file omits.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config file {}: {e}; using defaults",
                    config_path.display()
                );
                Config::default()
            }
        },
        Err(_) => {
            tracing::info!("No config file at {}, using defaults", config_path.display());
            Config::default()
        }
    }
}

pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.workspace_base_dir, "/tmp/xsha-workspaces");
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.scheduler_interval(), Duration::from_secs(5));
        assert_eq!(config.git_clone_timeout(), Duration::from_secs(300));
        assert_eq!(config.docker_execution_timeout(), Duration::from_secs(7200));
        assert!(!config.git_ssl_verify);
        assert!(!config.git_proxy.enabled);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"max_concurrent_tasks": 8, "aes_key": "k"}"#).unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.aes_key, "k");
        assert_eq!(config.workspace_base_dir, "/tmp/xsha-workspaces");
    }
}
