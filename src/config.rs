use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Error};
use config::Config;

use crate::domain::{lifecycle::Timeouts, pull::PullSettings};

const CONFIG_FILE: &str = "stackyard";
const ENV_PREFIX: &str = "stackyard";

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    pub docker: DockerConfig,
    pub timeouts: TimeoutConfig,
    pub pull: PullConfig,
    pub registry: RegistryFileConfig,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Memory,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    pub socket: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fast_secs: u64,
    pub long_secs: u64,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullConfig {
    pub max_retries: u32,
    pub backoff_millis: u64,
    pub retention_secs: u64,
    pub require_mirror: bool,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RegistryFileConfig {
    /// Where to render Docker's `daemon.json` when the registry settings change.
    pub daemon_config_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("./data"),
            storage: StorageKind::File,
            docker: DockerConfig::default(),
            timeouts: TimeoutConfig::default(),
            pull: PullConfig::default(),
            registry: RegistryFileConfig::default(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_string(),
            connect_timeout_secs: 120,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fast_secs: 30,
            long_secs: 600,
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_millis: 500,
            retention_secs: 300,
            require_mirror: false,
        }
    }
}

impl AppConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            fast: Duration::from_secs(self.timeouts.fast_secs),
            long: Duration::from_secs(self.timeouts.long_secs),
        }
    }

    pub fn pull_settings(&self) -> PullSettings {
        PullSettings {
            max_retries: self.pull.max_retries,
            backoff: Duration::from_millis(self.pull.backoff_millis),
            retention: Duration::from_secs(self.pull.retention_secs),
            timeout: Duration::from_secs(self.timeouts.long_secs),
            require_mirror: self.pull.require_mirror,
        }
    }
}

/// Optional `stackyard.toml`, then `STACKYARD__SECTION__KEY` variables.
pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::File::with_name(CONFIG_FILE).required(false))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__"))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AppConfig::default();
        assert_eq!(config.timeouts().fast, Duration::from_secs(30));
        assert_eq!(config.pull_settings().timeout, Duration::from_secs(600));
        assert_eq!(config.storage, StorageKind::File);
    }

    #[test]
    fn nested_sections_deserialize_partially() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "storage = \"memory\"\n[pull]\nrequire_mirror = true\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert!(config.pull.require_mirror);
        assert_eq!(config.pull.max_retries, 3);
        assert_eq!(config.docker.socket, "/var/run/docker.sock");
    }
}
