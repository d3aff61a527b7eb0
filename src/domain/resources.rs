use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use log::info;

use super::error::{Error, Result};
use super::lifecycle::Timeouts;
use super::manifest::ServiceSpec;
use super::model::{
    ContainerInfo, ContainerRequest, ImageSummary, NetworkSummary, PruneReport, SystemInfo,
    SystemStats, VolumeSummary,
};
use super::port::RuntimeControlPlane;
use super::registry_config::{RegistryConfigManager, RegistryHint};

/// Containers, images, networks and volumes outside of any project, plus
/// the daemon's own view of the host.
pub struct ResourceService {
    runtime: Arc<dyn RuntimeControlPlane>,
    registry: Arc<RegistryConfigManager>,
    timeouts: Timeouts,
    require_mirror: bool,
}

impl ResourceService {
    pub fn new(
        runtime: Arc<dyn RuntimeControlPlane>,
        registry: Arc<RegistryConfigManager>,
        timeouts: Timeouts,
        require_mirror: bool,
    ) -> Self {
        Self {
            runtime,
            registry,
            timeouts,
            require_mirror,
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        self.fast("list containers", self.runtime.list_containers(all)).await
    }

    /// Creates the container without starting it. The image is fetched
    /// through the registry settings when the daemon lacks it.
    pub async fn create_container(&self, request: ContainerRequest) -> Result<ContainerInfo> {
        required("name", &request.name)?;
        required("image", &request.image)?;
        let body = serde_yaml::to_value(&request)
            .map_err(|e| Error::malformed("$", format!("container request cannot be read: {e}")))?;
        let mut spec = ServiceSpec::parse(&request.name, &body)?;
        spec.container_name = Some(request.name.clone());
        spec.require_deployable()?;
        let pull = self
            .registry
            .resolve_pull(&request.image, &RegistryHint::parse(None, self.require_mirror))
            .await?;
        let container = bounded(
            self.timeouts.long,
            "create container",
            self.runtime.create_container(&spec, &pull),
        )
        .await?;
        info!("Container {} created from {}", container.name, container.image);
        Ok(container)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        required("id", id)?;
        self.fast("start container", self.runtime.start_container(id)).await?;
        info!("Container {} started", id);
        Ok(())
    }

    pub async fn stop_container(&self, id: &str) -> Result<()> {
        required("id", id)?;
        self.fast("stop container", self.runtime.stop_container(id)).await?;
        info!("Container {} stopped", id);
        Ok(())
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        required("id", id)?;
        self.fast("remove container", self.runtime.remove_container(id, force))
            .await?;
        info!("Container {} removed", id);
        Ok(())
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        self.fast("system info", self.runtime.system_info()).await
    }

    /// Sampling takes the daemon about a second per container.
    pub async fn system_stats(&self) -> Result<SystemStats> {
        let containers = bounded(self.timeouts.long, "container stats", self.runtime.container_stats()).await?;
        Ok(SystemStats {
            observed_at: Utc::now(),
            containers,
        })
    }

    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.fast("list images", self.runtime.list_images()).await
    }

    pub async fn remove_image(&self, reference: &str) -> Result<()> {
        required("reference", reference)?;
        self.fast("remove image", self.runtime.remove_image(reference)).await?;
        info!("Image {} removed", reference);
        Ok(())
    }

    /// `target` is `repo[:tag]`; the tag defaults to `latest`.
    pub async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        required("source", source)?;
        required("target", target)?;
        let (repo, tag) = split_target(target);
        self.fast("tag image", self.runtime.tag_image(source, repo, tag))
            .await?;
        info!("Image {} tagged as {}:{}", source, repo, tag);
        Ok(())
    }

    pub async fn export_image(&self, reference: &str) -> Result<Bytes> {
        required("reference", reference)?;
        bounded(self.timeouts.long, "export image", self.runtime.export_image(reference)).await
    }

    pub async fn import_image(&self, archive: Bytes) -> Result<()> {
        if archive.is_empty() {
            return Err(Error::malformed("archive", "image archive is empty"));
        }
        let size = archive.len();
        bounded(self.timeouts.long, "import image", self.runtime.import_image(archive)).await?;
        info!("Image archive of {} bytes imported", size);
        Ok(())
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        self.fast("list networks", self.runtime.list_networks()).await
    }

    pub async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<NetworkSummary> {
        required("name", name)?;
        let network = self
            .fast("create network", self.runtime.create_network(name, driver))
            .await?;
        info!("Network {} created ({})", network.name, network.driver);
        Ok(network)
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        self.fast("remove network", self.runtime.remove_network(name)).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        self.fast("list volumes", self.runtime.list_volumes()).await
    }

    pub async fn create_volume(&self, name: &str) -> Result<VolumeSummary> {
        required("name", name)?;
        let volume = self.fast("create volume", self.runtime.create_volume(name)).await?;
        info!("Volume {} created", volume.name);
        Ok(volume)
    }

    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        self.fast("remove volume", self.runtime.remove_volume(name, force))
            .await
    }

    pub async fn prune_volumes(&self) -> Result<PruneReport> {
        let report = self.fast("prune volumes", self.runtime.prune_volumes()).await?;
        info!(
            "Pruned {} volumes, {} bytes reclaimed",
            report.deleted.len(),
            report.space_reclaimed
        );
        Ok(report)
    }

    async fn fast<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.timeouts.fast, what, call).await
    }
}

async fn bounded<T>(bound: Duration, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(bound, call)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(format!("{what} exceeded {bound:?}"))))
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::malformed(field, "must not be empty"));
    }
    Ok(())
}

/// Splits `repo[:tag]`, leaving registry ports such as `host:5000/app` intact.
pub fn split_target(target: &str) -> (&str, &str) {
    match target.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (target, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ContainerState;
    use crate::domain::testing::FakeRuntime;
    use crate::infra::memory_store::MemoryRecordStore;

    async fn service() -> (ResourceService, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = RegistryConfigManager::load(Arc::new(MemoryRecordStore::new()), None)
            .await
            .unwrap();
        let timeouts = Timeouts {
            fast: Duration::from_secs(5),
            long: Duration::from_secs(5),
        };
        (
            ResourceService::new(runtime.clone(), Arc::new(registry), timeouts, false),
            runtime,
        )
    }

    fn request(name: &str, image: &str) -> ContainerRequest {
        ContainerRequest {
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            ports: vec!["6379:6379".to_string()],
            volumes: Vec::new(),
            environment: vec!["MODE=cache".to_string()],
            restart: None,
        }
    }

    #[tokio::test]
    async fn standalone_containers_are_created_started_and_removed() {
        let (service, runtime) = service().await;
        let created = service.create_container(request("cache", "redis:7")).await.unwrap();
        assert_eq!(created.state, ContainerState::Created);
        assert_eq!(runtime.pulled(), vec!["redis:7".to_string()]);
        assert!(service.list_containers(false).await.unwrap().is_empty());

        service.start_container(&created.id).await.unwrap();
        let running = service.list_containers(false).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "cache");

        assert!(matches!(
            service.remove_container(&created.id, false).await,
            Err(Error::RuntimeFailure(_))
        ));
        service.stop_container(&created.id).await.unwrap();
        service.remove_container(&created.id, false).await.unwrap();
        assert!(service.list_containers(true).await.unwrap().is_empty());
        assert!(matches!(
            service.start_container(&created.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn container_requests_are_validated_like_services() {
        let (service, runtime) = service().await;
        let mut bad_port = request("cache", "redis:7");
        bad_port.ports = vec!["redis".to_string()];
        assert!(matches!(
            service.create_container(bad_port).await,
            Err(Error::MalformedManifest { .. })
        ));
        let mut relative = request("cache", "redis:7");
        relative.volumes = vec!["./data:/data".to_string()];
        assert!(matches!(
            service.create_container(relative).await,
            Err(Error::MalformedManifest { .. })
        ));
        assert!(matches!(
            service.create_container(request("cache", " ")).await,
            Err(Error::MalformedManifest { .. })
        ));
        assert!(runtime.pulled().is_empty());
    }

    #[tokio::test]
    async fn system_views_count_containers() {
        let (service, runtime) = service().await;
        runtime.add_image("sha256:abc", "redis:7");
        let created = service.create_container(request("cache", "redis:7")).await.unwrap();
        service.create_container(request("idle", "redis:7")).await.unwrap();
        service.start_container(&created.id).await.unwrap();

        let info = service.system_info().await.unwrap();
        assert_eq!(info.containers, 2);
        assert_eq!(info.containers_running, 1);
        assert_eq!(info.images, 1);
        let stats = service.system_stats().await.unwrap();
        assert_eq!(stats.containers.len(), 1);
        assert_eq!(stats.containers[0].name, "cache");
    }

    #[tokio::test]
    async fn images_can_be_tagged_exported_and_removed() {
        let (service, runtime) = service().await;
        runtime.add_image("sha256:abc", "redis:7");
        service.tag_image("redis:7", "registry.local:5000/redis").await.unwrap();
        let images = service.list_images().await.unwrap();
        assert!(images[0].tags.contains(&"registry.local:5000/redis:latest".to_string()));

        let archive = service.export_image("redis:7").await.unwrap();
        assert!(!archive.is_empty());
        service.remove_image("sha256:abc").await.unwrap();
        assert!(matches!(
            service.remove_image("sha256:abc").await,
            Err(Error::NotFound(_))
        ));
        service.import_image(archive).await.unwrap();
        assert_eq!(service.list_images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_arguments_are_rejected() {
        let (service, _) = service().await;
        assert!(matches!(
            service.remove_image(" ").await,
            Err(Error::MalformedManifest { .. })
        ));
        assert!(matches!(
            service.import_image(Bytes::new()).await,
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[tokio::test]
    async fn networks_and_volumes_round_trip() {
        let (service, _) = service().await;
        let network = service.create_network("shared", None).await.unwrap();
        assert_eq!(network.driver, "bridge");
        assert_eq!(service.list_networks().await.unwrap().len(), 1);
        service.remove_network("shared").await.unwrap();

        service.create_volume("data").await.unwrap();
        service.create_volume("cache").await.unwrap();
        service.remove_volume("cache", false).await.unwrap();
        let report = service.prune_volumes().await.unwrap();
        assert_eq!(report.deleted, vec!["data".to_string()]);
        assert!(service.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_runtime_is_reported() {
        let (service, runtime) = service().await;
        runtime.set_unavailable(true);
        assert!(matches!(
            service.list_images().await,
            Err(Error::RuntimeUnavailable(_))
        ));
    }

    #[test]
    fn tag_targets_default_to_latest() {
        assert_eq!(split_target("app"), ("app", "latest"));
        assert_eq!(split_target("app:1.0"), ("app", "1.0"));
        assert_eq!(split_target("host:5000/app"), ("host:5000/app", "latest"));
        assert_eq!(split_target("host:5000/app:2"), ("host:5000/app", "2"));
    }
}
