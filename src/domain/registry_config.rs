//! Process-wide registry, mirror and proxy configuration.
//!
//! Starts empty unless a persisted value exists. `set` replaces the whole
//! value; there is no field-level merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::error::{Error, Result};
use super::model::{PullRequest, RegistryConfig, RegistryCredentials};
use super::port::RecordStore;

const NAMESPACE: &str = "registry";
const KEY: &str = "config";
const DOCKER_HUB: &str = "docker.io";

/// How an image should reach the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryHint {
    Direct,
    Mirror,
    Proxy,
    /// A registry host that must have an entry in the configuration.
    Registry(String),
}

impl RegistryHint {
    pub fn parse(hint: Option<&str>, require_mirror: bool) -> Self {
        match hint.map(str::trim) {
            None | Some("") if require_mirror => RegistryHint::Mirror,
            None | Some("") | Some("direct") => RegistryHint::Direct,
            Some("mirror") => RegistryHint::Mirror,
            Some("proxy") => RegistryHint::Proxy,
            Some(host) => RegistryHint::Registry(host.to_string()),
        }
    }
}

pub struct RegistryConfigManager {
    current: RwLock<Option<RegistryConfig>>,
    records: Arc<dyn RecordStore>,
    daemon_config_path: Option<PathBuf>,
}

impl RegistryConfigManager {
    /// Loads the persisted configuration, if any.
    pub async fn load(records: Arc<dyn RecordStore>, daemon_config_path: Option<PathBuf>) -> Result<Self> {
        let current = match records.load(NAMESPACE, KEY).await? {
            Some(data) => match serde_json::from_slice::<RegistryConfig>(&data) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring unreadable registry configuration: {}", e);
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            current: RwLock::new(current),
            records,
            daemon_config_path,
        })
    }

    pub async fn get(&self) -> Option<RegistryConfig> {
        self.current.read().await.clone()
    }

    pub async fn set(&self, config: RegistryConfig) -> Result<()> {
        let data = serde_json::to_vec_pretty(&config)
            .map_err(|e| Error::storage(format!("cannot encode registry configuration: {e}")))?;
        let mut current = self.current.write().await;
        self.records.save(NAMESPACE, KEY, &data).await?;
        if let Some(path) = &self.daemon_config_path {
            write_daemon_config(path, &render_daemon_config(Some(&config))).await?;
        }
        info!(
            "Registry configuration replaced ({} mirrors, {} registries, proxy {})",
            config.mirrors.len(),
            config.registries.len(),
            if config.proxy.is_some() { "set" } else { "unset" }
        );
        *current = Some(config);
        Ok(())
    }

    /// Docker `daemon.json` document matching the current configuration.
    pub async fn daemon_config(&self) -> Value {
        render_daemon_config(self.current.read().await.as_ref())
    }

    /// Checks the pull's preconditions and resolves the reference to fetch.
    /// Never touches the network.
    pub async fn resolve_pull(&self, image: &str, hint: &RegistryHint) -> Result<PullRequest> {
        let current = self.current.read().await;
        let config = current.as_ref();
        let reference = match hint {
            RegistryHint::Direct => image.to_string(),
            RegistryHint::Mirror => {
                let mirror = config
                    .and_then(|c| c.mirrors.first())
                    .ok_or(Error::NoMirrorConfigured)?;
                through_mirror(image, mirror)
            }
            RegistryHint::Proxy => {
                config
                    .and_then(|c| c.proxy.as_ref())
                    .filter(|p| !p.http_proxy.is_empty() || !p.https_proxy.is_empty())
                    .ok_or(Error::NoProxyConfigured)?;
                image.to_string()
            }
            RegistryHint::Registry(host) => {
                config
                    .and_then(|c| c.registries.get(host))
                    .ok_or_else(|| Error::not_found(format!("registry {host}")))?;
                if registry_host(image) == Some(host.as_str()) {
                    image.to_string()
                } else {
                    format!("{host}/{}", repository_path(image))
                }
            }
        };
        let credentials = config.and_then(|c| {
            let host = registry_host(&reference).unwrap_or(DOCKER_HUB);
            c.registries.get(host).map(|entry| RegistryCredentials {
                server: entry.url.clone(),
                username: entry.username.clone(),
                password: entry.password.clone(),
            })
        });
        Ok(PullRequest { reference, credentials })
    }
}

/// Registry host of a reference, `None` for Docker Hub short names.
fn registry_host(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}

/// Repository path as Docker Hub sees it, `library/` added for official images.
fn repository_path(image: &str) -> String {
    match registry_host(image) {
        Some(host) => image[host.len() + 1..].to_string(),
        None if image.contains('/') => image.to_string(),
        None => format!("library/{image}"),
    }
}

/// Mirrors only front Docker Hub. Other registries are left untouched.
fn through_mirror(image: &str, mirror: &str) -> String {
    if registry_host(image).is_some() {
        return image.to_string();
    }
    let mirror = mirror
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!("{mirror}/{}", repository_path(image))
}

fn render_daemon_config(config: Option<&RegistryConfig>) -> Value {
    let mut document = json!({});
    let Some(config) = config else {
        return document;
    };
    if !config.mirrors.is_empty() {
        document["registry-mirrors"] = json!(config.mirrors);
    }
    if let Some(proxy) = &config.proxy {
        let mut proxies = json!({});
        for (key, value) in [
            ("http-proxy", &proxy.http_proxy),
            ("https-proxy", &proxy.https_proxy),
            ("no-proxy", &proxy.no_proxy),
        ] {
            if !value.is_empty() {
                proxies[key] = json!(value);
            }
        }
        document["proxies"] = proxies;
    }
    document
}

async fn write_daemon_config(path: &Path, document: &Value) -> Result<()> {
    let data = serde_json::to_vec_pretty(document)
        .map_err(|e| Error::storage(format!("cannot encode daemon configuration: {e}")))?;
    tokio::fs::write(path, data)
        .await
        .map_err(|e| Error::storage(format!("cannot write {}: {e}", path.display())))?;
    info!("Daemon configuration written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::model::{ProxyConfig, RegistryEntry};
    use crate::infra::memory_store::MemoryRecordStore;

    async fn manager() -> RegistryConfigManager {
        RegistryConfigManager::load(Arc::new(MemoryRecordStore::new()), None)
            .await
            .unwrap()
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            proxy: Some(ProxyConfig {
                http_proxy: "http://proxy:3128".into(),
                https_proxy: String::new(),
                no_proxy: "localhost".into(),
            }),
            mirrors: vec!["https://mirror.example.com/".into()],
            registries: BTreeMap::from([(
                "ghcr.io".to_string(),
                RegistryEntry {
                    name: "GitHub".into(),
                    url: "ghcr.io".into(),
                    username: Some("bot".into()),
                    password: Some("token".into()),
                },
            )]),
        }
    }

    #[tokio::test]
    async fn empty_configuration_fails_mirror_and_proxy_pulls() {
        let manager = manager().await;
        assert_eq!(manager.get().await, None);
        assert!(matches!(
            manager.resolve_pull("redis:7", &RegistryHint::Mirror).await,
            Err(Error::NoMirrorConfigured)
        ));
        assert!(matches!(
            manager.resolve_pull("redis:7", &RegistryHint::Proxy).await,
            Err(Error::NoProxyConfigured)
        ));
        let direct = manager.resolve_pull("redis:7", &RegistryHint::Direct).await.unwrap();
        assert_eq!(direct.reference, "redis:7");
        assert_eq!(direct.credentials, None);
    }

    #[tokio::test]
    async fn mirror_rewrites_docker_hub_references_only() {
        let manager = manager().await;
        manager.set(config()).await.unwrap();
        let pull = manager.resolve_pull("redis:7", &RegistryHint::Mirror).await.unwrap();
        assert_eq!(pull.reference, "mirror.example.com/library/redis:7");
        let pull = manager.resolve_pull("bitnami/redis", &RegistryHint::Mirror).await.unwrap();
        assert_eq!(pull.reference, "mirror.example.com/bitnami/redis");
        let pull = manager.resolve_pull("ghcr.io/org/app:1", &RegistryHint::Mirror).await.unwrap();
        assert_eq!(pull.reference, "ghcr.io/org/app:1");
        assert_eq!(pull.credentials.unwrap().username.as_deref(), Some("bot"));
    }

    #[tokio::test]
    async fn registry_hint_needs_a_configured_host() {
        let manager = manager().await;
        manager.set(config()).await.unwrap();
        let pull = manager
            .resolve_pull("org/app:2", &RegistryHint::Registry("ghcr.io".into()))
            .await
            .unwrap();
        assert_eq!(pull.reference, "ghcr.io/org/app:2");
        assert!(pull.credentials.is_some());
        assert!(matches!(
            manager
                .resolve_pull("app", &RegistryHint::Registry("quay.io".into()))
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_replaces_and_persists_the_whole_value() {
        let records = Arc::new(MemoryRecordStore::new());
        let manager = RegistryConfigManager::load(records.clone(), None).await.unwrap();
        manager.set(config()).await.unwrap();
        manager
            .set(RegistryConfig {
                mirrors: vec!["m2".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let current = manager.get().await.unwrap();
        assert_eq!(current.proxy, None);
        assert!(current.registries.is_empty());

        let reloaded = RegistryConfigManager::load(records, None).await.unwrap();
        assert_eq!(reloaded.get().await, Some(current));
    }

    #[tokio::test]
    async fn daemon_config_mirrors_the_original_layout() {
        let manager = manager().await;
        assert_eq!(manager.daemon_config().await, json!({}));
        manager.set(config()).await.unwrap();
        assert_eq!(
            manager.daemon_config().await,
            json!({
                "registry-mirrors": ["https://mirror.example.com/"],
                "proxies": {"http-proxy": "http://proxy:3128", "no-proxy": "localhost"}
            })
        );
    }

    #[test]
    fn hints_parse_with_mirror_default() {
        assert_eq!(RegistryHint::parse(None, false), RegistryHint::Direct);
        assert_eq!(RegistryHint::parse(None, true), RegistryHint::Mirror);
        assert_eq!(RegistryHint::parse(Some("proxy"), true), RegistryHint::Proxy);
        assert_eq!(
            RegistryHint::parse(Some("ghcr.io"), false),
            RegistryHint::Registry("ghcr.io".into())
        );
    }
}
