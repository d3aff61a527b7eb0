//! In-memory control plane for domain tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use super::error::{Error, Result};
use super::manifest::{ComposeProject, ServiceSpec};
use super::model::{
    ContainerInfo, ContainerState, ContainerStats, ImagePulls, SystemInfo, ImageSummary, LayerPhase, LogLine, LogStream, NetworkSummary, ProgressEvent,
    PruneReport, PullRequest, ServiceFailure, ServiceOutcome, ServiceStatus, VolumeSummary,
};
use super::port::RuntimeControlPlane;

/// What the next `pull_image` call produces.
pub enum PullScript {
    /// Yields every item then ends.
    Finish(Vec<Result<ProgressEvent>>),
    /// Yields every event then never ends.
    Hang(Vec<ProgressEvent>),
}

#[derive(Default)]
pub struct FakeRuntime {
    projects: Mutex<BTreeMap<String, BTreeMap<String, ContainerState>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    unavailable: AtomicBool,
    teardown_failures: Mutex<Vec<ServiceFailure>>,
    pulls: Mutex<VecDeque<PullScript>>,
    pulled: Mutex<Vec<String>>,
    applied_pulls: Mutex<Vec<PullRequest>>,
    images: Mutex<Vec<ImageSummary>>,
    networks: Mutex<Vec<NetworkSummary>>,
    volumes: Mutex<Vec<VolumeSummary>>,
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    pub apply_calls: AtomicUsize,
}

pub fn progress(layer: &str, phase: LayerPhase, done: u64) -> ProgressEvent {
    ProgressEvent {
        layer_id: layer.to_string(),
        phase,
        bytes_done: done,
        bytes_total: 100,
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Services with this name fail to start in every project.
    pub fn fail_service(&self, service: &str) {
        self.failing.lock().unwrap().insert(service.to_string());
    }

    /// Every lifecycle call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_teardown(&self, service: &str, detail: &str) {
        self.teardown_failures.lock().unwrap().push(ServiceFailure {
            service: service.to_string(),
            detail: detail.to_string(),
        });
    }

    /// Marks a container dead, as if it had crashed.
    pub fn kill(&self, project: &str, service: &str) {
        if let Some(services) = self.projects.lock().unwrap().get_mut(project) {
            services.insert(service.to_string(), ContainerState::Dead);
        }
    }

    pub fn has_project(&self, project: &str) -> bool {
        self.projects.lock().unwrap().contains_key(project)
    }

    pub fn script_pull(&self, script: PullScript) {
        self.pulls.lock().unwrap().push_back(script);
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    /// Every pull handed to `apply_project`, in call order.
    pub fn applied_pulls(&self) -> Vec<PullRequest> {
        self.applied_pulls.lock().unwrap().clone()
    }

    pub fn add_image(&self, id: &str, tag: &str) {
        self.images.lock().unwrap().push(ImageSummary {
            id: id.to_string(),
            tags: vec![tag.to_string()],
            size: 1024,
            created: 0,
        });
    }

    async fn enter(&self) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::RuntimeUnavailable("fake daemon is down".into()));
        }
        Ok(())
    }

    fn set_container(&self, id: &str, state: ContainerState) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("container {id}")))?;
        container.state = state;
        Ok(())
    }

    fn project_containers(&self) -> Vec<ContainerInfo> {
        self.projects
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(project, services)| {
                services.iter().map(move |(service, state)| ContainerInfo {
                    id: format!("{project}-{service}-id"),
                    name: format!("{project}-{service}-1"),
                    image: service.clone(),
                    state: *state,
                    status: format!("{state:?}"),
                    project: Some(project.clone()),
                })
            })
            .collect()
    }

    fn set_all(&self, name: &str, state: ContainerState) -> Result<Vec<ServiceOutcome>> {
        let mut projects = self.projects.lock().unwrap();
        let services = projects
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("project {name}")))?;
        let failing = self.failing.lock().unwrap();
        Ok(services
            .iter_mut()
            .map(|(service, current)| {
                if state == ContainerState::Running && failing.contains(service) {
                    *current = ContainerState::Exited;
                    ServiceOutcome::failed(service.clone(), "exited with code 1")
                } else {
                    *current = state;
                    ServiceOutcome::started(service.clone())
                }
            })
            .collect())
    }
}

#[async_trait]
impl RuntimeControlPlane for FakeRuntime {
    async fn apply_project(
        &self,
        name: &str,
        project: &ComposeProject,
        pulls: &ImagePulls,
    ) -> Result<Vec<ServiceOutcome>> {
        self.enter().await?;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applied_pulls.lock().unwrap().extend(pulls.values().cloned());
        let services = project
            .services
            .iter()
            .map(|service| (service.name.clone(), ContainerState::Created))
            .collect();
        self.projects.lock().unwrap().insert(name.to_string(), services);
        self.set_all(name, ContainerState::Running)
    }

    async fn project_status(&self, name: &str) -> Result<Vec<ServiceStatus>> {
        self.enter().await?;
        let projects = self.projects.lock().unwrap();
        Ok(projects
            .get(name)
            .map(|services| {
                services
                    .iter()
                    .map(|(service, state)| ServiceStatus {
                        service: service.clone(),
                        container_id: format!("{name}-{service}-id"),
                        container_name: format!("{name}-{service}-1"),
                        state: *state,
                        status: format!("{state:?}"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn start_project(&self, name: &str) -> Result<Vec<ServiceOutcome>> {
        self.enter().await?;
        self.set_all(name, ContainerState::Running)
    }

    async fn stop_project(&self, name: &str) -> Result<Vec<ServiceOutcome>> {
        self.enter().await?;
        self.set_all(name, ContainerState::Exited)
    }

    async fn remove_project(&self, name: &str) -> Result<Vec<ServiceFailure>> {
        self.enter().await?;
        self.projects.lock().unwrap().remove(name);
        Ok(self.teardown_failures.lock().unwrap().clone())
    }

    async fn project_logs(&self, name: &str, tail: usize) -> Result<Vec<LogLine>> {
        self.enter().await?;
        let projects = self.projects.lock().unwrap();
        let services = projects
            .get(name)
            .ok_or_else(|| Error::not_found(format!("project {name}")))?;
        Ok(services
            .keys()
            .flat_map(|service| {
                (0..3).map(move |i| LogLine {
                    service: service.clone(),
                    stream: LogStream::Stdout,
                    message: format!("line {i}"),
                })
            })
            .take(tail)
            .collect())
    }

    fn pull_image(&self, request: &PullRequest) -> BoxStream<'static, Result<ProgressEvent>> {
        self.pulled.lock().unwrap().push(request.reference.clone());
        let script = self.pulls.lock().unwrap().pop_front();
        match script {
            Some(PullScript::Finish(items)) => stream::iter(items).boxed(),
            Some(PullScript::Hang(events)) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            None => stream::iter(vec![
                Ok(progress("l1", LayerPhase::Downloading, 50)),
                Ok(progress("l1", LayerPhase::Complete, 100)),
            ])
            .boxed(),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.enter().await?;
        Ok(self.images.lock().unwrap().clone())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.enter().await?;
        let mut images = self.images.lock().unwrap();
        let before = images.len();
        images.retain(|image| image.id != reference && !image.tags.iter().any(|t| t == reference));
        if images.len() == before {
            return Err(Error::not_found(format!("image {reference}")));
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        self.enter().await?;
        let mut images = self.images.lock().unwrap();
        let image = images
            .iter_mut()
            .find(|image| image.id == source || image.tags.iter().any(|t| t == source))
            .ok_or_else(|| Error::not_found(format!("image {source}")))?;
        image.tags.push(format!("{repo}:{tag}"));
        Ok(())
    }

    async fn export_image(&self, reference: &str) -> Result<Bytes> {
        self.enter().await?;
        let images = self.images.lock().unwrap();
        images
            .iter()
            .find(|image| image.id == reference || image.tags.iter().any(|t| t == reference))
            .map(|image| Bytes::from(image.id.clone().into_bytes()))
            .ok_or_else(|| Error::not_found(format!("image {reference}")))
    }

    async fn import_image(&self, archive: Bytes) -> Result<()> {
        self.enter().await?;
        let id = String::from_utf8_lossy(&archive).to_string();
        self.add_image(&id, &format!("{id}:imported"));
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        self.enter().await?;
        Ok(self.networks.lock().unwrap().clone())
    }

    async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<NetworkSummary> {
        self.enter().await?;
        let network = NetworkSummary {
            id: format!("{name}-id"),
            name: name.to_string(),
            driver: driver.unwrap_or("bridge").to_string(),
        };
        self.networks.lock().unwrap().push(network.clone());
        Ok(network)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.enter().await?;
        let mut networks = self.networks.lock().unwrap();
        let before = networks.len();
        networks.retain(|network| network.name != name);
        if networks.len() == before {
            return Err(Error::not_found(format!("network {name}")));
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        self.enter().await?;
        Ok(self.volumes.lock().unwrap().clone())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeSummary> {
        self.enter().await?;
        let volume = VolumeSummary {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
        };
        self.volumes.lock().unwrap().push(volume.clone());
        Ok(volume)
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> Result<()> {
        self.enter().await?;
        let mut volumes = self.volumes.lock().unwrap();
        let before = volumes.len();
        volumes.retain(|volume| volume.name != name);
        if volumes.len() == before {
            return Err(Error::not_found(format!("volume {name}")));
        }
        Ok(())
    }

    async fn prune_volumes(&self) -> Result<PruneReport> {
        self.enter().await?;
        let deleted = self
            .volumes
            .lock()
            .unwrap()
            .drain(..)
            .map(|volume| volume.name)
            .collect();
        Ok(PruneReport {
            deleted,
            space_reclaimed: 0,
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        self.enter().await?;
        let mut containers = self.project_containers();
        containers.extend(self.containers.lock().unwrap().values().cloned());
        containers.retain(|container| all || container.state == ContainerState::Running);
        Ok(containers)
    }

    async fn create_container(&self, spec: &ServiceSpec, pull: &PullRequest) -> Result<ContainerInfo> {
        self.enter().await?;
        self.pulled.lock().unwrap().push(pull.reference.clone());
        let name = spec.container_name.clone().unwrap_or_else(|| spec.name.clone());
        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|container| container.name == name) {
            return Err(Error::RuntimeFailure(format!("409 name {name} is already in use")));
        }
        let container = ContainerInfo {
            id: format!("{name}-id"),
            name,
            image: spec.image.clone().unwrap_or_default(),
            state: ContainerState::Created,
            status: "Created".to_string(),
            project: None,
        };
        containers.insert(container.id.clone(), container.clone());
        Ok(container)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.enter().await?;
        self.set_container(id, ContainerState::Running)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.enter().await?;
        self.set_container(id, ContainerState::Exited)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.enter().await?;
        let mut containers = self.containers.lock().unwrap();
        match containers.get(id) {
            None => Err(Error::not_found(format!("container {id}"))),
            Some(container) if container.state == ContainerState::Running && !force => Err(
                Error::RuntimeFailure(format!("409 container {id} is running, stop it or force")),
            ),
            Some(_) => {
                containers.remove(id);
                Ok(())
            }
        }
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        self.enter().await?;
        let containers = self.list_containers(true).await?;
        let running = containers
            .iter()
            .filter(|container| container.state == ContainerState::Running)
            .count() as i64;
        Ok(SystemInfo {
            server_version: "27.0.0-fake".to_string(),
            operating_system: "FakeOS".to_string(),
            architecture: "x86_64".to_string(),
            cpus: 4,
            memory_total: 8 << 30,
            containers: containers.len() as i64,
            containers_running: running,
            containers_stopped: containers.len() as i64 - running,
            images: self.images.lock().unwrap().len() as i64,
            ..Default::default()
        })
    }

    async fn container_stats(&self) -> Result<Vec<ContainerStats>> {
        Ok(self
            .list_containers(false)
            .await?
            .into_iter()
            .map(|container| ContainerStats {
                id: container.id,
                name: container.name,
                cpu_percent: 1.5,
                memory_usage: 64 << 20,
                memory_limit: 1 << 30,
            })
            .collect())
    }
}
