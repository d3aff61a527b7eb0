use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::Manifest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Original compose document, kept verbatim. `None` for hand-authored templates.
    #[serde(default)]
    pub manifest: Option<Manifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub container: String,
    pub host: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectState {
    Unknown,
    Deploying,
    Running,
    PartiallyRunning,
    Stopped,
    Failed,
    Removed,
}

impl ProjectState {
    pub fn is_active(self) -> bool {
        self != ProjectState::Removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub source_template_id: Option<String>,
    pub manifest: Manifest,
    pub last_known_state: ProjectState,
    pub last_observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited,
    Created,
    Restarting,
    Paused,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state {
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "created" => ContainerState::Created,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container_id: String,
    pub container_name: String,
    pub state: ContainerState,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub service: String,
    pub detail: String,
}

/// Result of applying one service of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub service: String,
    pub error: Option<String>,
}

impl ServiceOutcome {
    pub fn started(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            error: None,
        }
    }

    pub fn failed(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            error: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectReport {
    pub name: String,
    pub state: ProjectState,
    pub observed_at: DateTime<Utc>,
    pub services: Vec<ServiceStatus>,
    pub failures: Vec<ServiceFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub service: String,
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub space_reclaimed: i64,
}

/// A container as listed by the runtime, inside a project or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    #[serde(default)]
    pub status: String,
    /// Owning project, from the compose project label.
    #[serde(default)]
    pub project: Option<String>,
}

/// A standalone container, described with the fields of a compose service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub server_version: String,
    pub operating_system: String,
    pub architecture: String,
    pub kernel_version: String,
    pub cpus: i64,
    pub memory_total: i64,
    pub containers: i64,
    pub containers_running: i64,
    pub containers_stopped: i64,
    pub images: i64,
    pub system_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub observed_at: DateTime<Utc>,
    pub containers: Vec<ContainerStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http_proxy: String,
    #[serde(default)]
    pub https_proxy: String,
    #[serde(default)]
    pub no_proxy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Keyed by registry host, e.g. `ghcr.io`.
    #[serde(default)]
    pub registries: std::collections::BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Fully resolved pull, ready to hand to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub reference: String,
    pub credentials: Option<RegistryCredentials>,
}

/// How each image of a project is fetched when the runtime lacks it, keyed by
/// the reference the manifest declares.
pub type ImagePulls = std::collections::BTreeMap<String, PullRequest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerPhase {
    Pending,
    Downloading,
    Verifying,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub layer_id: String,
    pub phase: LayerPhase,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PullStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PullStatus::Succeeded | PullStatus::Failed | PullStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PullOutcome {
    Succeeded,
    Failed { detail: String },
    Cancelled,
}

impl PullOutcome {
    pub fn status(&self) -> PullStatus {
        match self {
            PullOutcome::Succeeded => PullStatus::Succeeded,
            PullOutcome::Failed { .. } => PullStatus::Failed,
            PullOutcome::Cancelled => PullStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PullEvent {
    Progress(ProgressEvent),
    Finished(PullOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub id: String,
    pub image_name: String,
    pub registry_hint: Option<String>,
    pub status: PullStatus,
    pub events: usize,
    pub failure: Option<String>,
}

/// Records that could be read, plus a note for each one that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub warnings: Vec<String>,
}
