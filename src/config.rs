//! Configuration Management
//!
//! Handles persistent configuration storage for azprov.

use crate::azure::client::DEFAULT_ENDPOINT;
use crate::orchestrator::{ExecutorConfig, RunOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOCATION: &str = "westeurope";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Public keys tried, in order, under `~/.ssh` when no key file is given
const SSH_KEY_FILES: &[&str] = &["id_rsa.pub", "id_ed25519.pub"];

/// User configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Subscription to provision into
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Default region
    #[serde(default)]
    pub location: Option<String>,
    /// Resource Manager base URL
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Per-resource operation timeout
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Update existing resources whose configuration differs
    #[serde(default)]
    pub allow_update: Option<bool>,
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("azprov").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`; a missing or unreadable file yields the defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid config file {:?}: {}", path, e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Cannot read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    /// Get effective subscription (CLI > config > environment / Azure CLI)
    pub async fn effective_subscription(&self) -> Option<String> {
        match &self.subscription_id {
            Some(subscription) => Some(subscription.clone()),
            None => crate::azure::auth::default_subscription().await,
        }
    }

    /// Get effective location (CLI > config > `AZURE_LOCATION` > default)
    pub fn effective_location(&self) -> String {
        self.location
            .clone()
            .or_else(|| std::env::var("AZURE_LOCATION").ok().filter(|l| !l.is_empty()))
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string())
    }

    pub fn effective_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
            default_timeout: Duration::from_secs(
                self.operation_timeout_secs
                    .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS),
            ),
            allow_update: self.allow_update.unwrap_or(false),
            ..ExecutorConfig::default()
        }
    }

    pub fn run_options(&self, run_timeout: Option<Duration>) -> RunOptions {
        RunOptions {
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(1),
            run_timeout,
        }
    }

    /// Overlay values given on the command line
    pub fn merge(&mut self, overrides: Config) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }
        take!(
            subscription_id,
            location,
            endpoint,
            poll_interval_ms,
            operation_timeout_secs,
            max_concurrency,
            allow_update
        );
    }
}

/// Read the SSH public key installed on the VM admin account.
///
/// `explicit` wins when given; otherwise the default key files under
/// `ssh_dir` are tried. Missing or empty keys are an error.
pub fn load_ssh_public_key(explicit: Option<&Path>, ssh_dir: Option<&Path>) -> Result<String> {
    let candidates: Vec<PathBuf> = match (explicit, ssh_dir) {
        (Some(path), _) => vec![path.to_path_buf()],
        (None, Some(dir)) => SSH_KEY_FILES.iter().map(|file| dir.join(file)).collect(),
        (None, None) => anyhow::bail!("No home directory to look for SSH keys in; pass --ssh-public-key"),
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(key) if !key.trim().is_empty() => return Ok(key.trim().to_string()),
            Ok(_) => tracing::warn!("SSH public key {:?} is empty", path),
            Err(e) => tracing::debug!("No SSH public key at {:?}: {}", path, e),
        }
    }

    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    anyhow::bail!("No usable SSH public key (tried {}); pass --ssh-public-key", tried)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json"));
        assert_eq!(config, Config::default());
        assert_eq!(config.effective_endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.run_options(None).max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            subscription_id: Some("00000000-0000-0000-0000-000000000000".into()),
            location: Some("northeurope".into()),
            poll_interval_ms: Some(500),
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.effective_location(), "northeurope");
        assert_eq!(loaded.executor_config().poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let mut config = Config {
            location: Some("northeurope".into()),
            max_concurrency: Some(8),
            ..Config::default()
        };
        config.merge(Config {
            location: Some("eastus".into()),
            allow_update: Some(true),
            ..Config::default()
        });

        assert_eq!(config.location.as_deref(), Some("eastus"));
        assert_eq!(config.max_concurrency, Some(8));
        assert!(config.executor_config().allow_update);
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        let config = Config {
            max_concurrency: Some(0),
            ..Config::default()
        };
        assert_eq!(config.run_options(None).max_concurrency, 1);
    }

    #[test]
    fn test_ssh_key_falls_back_to_ed25519() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA user@host\n").unwrap();

        let key = load_ssh_public_key(None, Some(dir.path())).unwrap();
        assert_eq!(key, "ssh-ed25519 AAAA user@host");
    }

    #[test]
    fn test_explicit_ssh_key_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa DEFAULT").unwrap();
        let explicit = dir.path().join("deploy.pub");
        std::fs::write(&explicit, "ssh-rsa EXPLICIT").unwrap();

        let key = load_ssh_public_key(Some(&explicit), Some(dir.path())).unwrap();
        assert_eq!(key, "ssh-rsa EXPLICIT");
    }

    #[test]
    fn test_missing_or_empty_ssh_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_ssh_public_key(None, Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("id_rsa.pub"));

        std::fs::write(dir.path().join("id_rsa.pub"), "  \n").unwrap();
        assert!(load_ssh_public_key(None, Some(dir.path())).is_err());
        assert!(load_ssh_public_key(Some(&dir.path().join("absent.pub")), None).is_err());
    }
}
