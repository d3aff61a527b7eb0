use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::error::Result;
use super::manifest::{ComposeProject, ServiceSpec};
use super::model::{
    ContainerInfo, ContainerStats, ImagePulls, ImageSummary, LogLine, NetworkSummary, ProgressEvent,
    PruneReport, PullRequest, ServiceFailure, ServiceOutcome, ServiceStatus, SystemInfo, VolumeSummary,
};

/// The container runtime as seen by the domain. Multi-service projects are
/// addressed by name; the adapter decides how a project maps onto containers.
#[async_trait]
pub trait RuntimeControlPlane: Send + Sync {
    /// Creates or recreates every service. One failing service does not stop the others.
    /// Missing images are fetched as `pulls` says, then tagged as declared.
    async fn apply_project(
        &self,
        name: &str,
        project: &ComposeProject,
        pulls: &ImagePulls,
    ) -> Result<Vec<ServiceOutcome>>;

    async fn project_status(&self, name: &str) -> Result<Vec<ServiceStatus>>;

    async fn start_project(&self, name: &str) -> Result<Vec<ServiceOutcome>>;

    async fn stop_project(&self, name: &str) -> Result<Vec<ServiceOutcome>>;

    /// Best effort: every resource is attempted, failures are reported, not raised.
    async fn remove_project(&self, name: &str) -> Result<Vec<ServiceFailure>>;

    async fn project_logs(&self, name: &str, tail: usize) -> Result<Vec<LogLine>>;

    fn pull_image(&self, request: &PullRequest) -> BoxStream<'static, Result<ProgressEvent>>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    async fn remove_image(&self, reference: &str) -> Result<()>;

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()>;

    async fn export_image(&self, reference: &str) -> Result<Bytes>;

    async fn import_image(&self, archive: Bytes) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>>;

    async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<NetworkSummary>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>>;

    async fn create_volume(&self, name: &str) -> Result<VolumeSummary>;

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()>;

    async fn prune_volumes(&self) -> Result<PruneReport>;

    /// Every container when `all`, running ones otherwise.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Creates, without starting, a container outside of any project.
    async fn create_container(&self, spec: &ServiceSpec, pull: &PullRequest) -> Result<ContainerInfo>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn system_info(&self) -> Result<SystemInfo>;

    /// Resource usage of the running containers.
    async fn container_stats(&self) -> Result<Vec<ContainerStats>>;
}

/// Durable raw records grouped by namespace.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn save(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Returns whether a record existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;
}
