use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bollard::{
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        NetworkingConfig, RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
        StopContainerOptions,
    },
    image::{CreateImageOptions, ImportImageOptions, ListImagesOptions, RemoveImageOptions, TagImageOptions},
    network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions},
    secret::{
        ContainerSummary, CreateImageInfo, EndpointSettings, HostConfig, PortBinding as DockerPortBinding,
        RestartPolicy, RestartPolicyNameEnum,
    },
    volume::{CreateVolumeOptions, ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions},
    Docker,
};
use bytes::{Bytes, BytesMut};
use futures::{future, stream::BoxStream, StreamExt, TryStreamExt};
use itertools::Itertools;
use log::{debug, info, warn};
use map_macro::hash_map;

use crate::domain::{
    error::{Error, Result},
    manifest::{ComposeProject, ServiceSpec},
    model::{
        ContainerInfo, ContainerState, ContainerStats, ImagePulls, ImageSummary, LayerPhase, LogLine,
        LogStream, NetworkSummary, ProgressEvent, PruneReport, PullRequest, ServiceFailure,
        ServiceOutcome, ServiceStatus, SystemInfo, VolumeSummary,
    },
    port::RuntimeControlPlane,
    resources::split_target,
};

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";
const NETWORK_LABEL: &str = "com.docker.compose.network";
const VOLUME_LABEL: &str = "com.docker.compose.volume";
const MANAGED_LABEL: &str = "stackyard.managed";
const STOP_GRACE_SECS: i64 = 10;

/// Compose projects emulated on a plain Docker daemon through the compose labels.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn project_containers(&self, project: &str) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: hash_map! {
                    "label" => vec![format!("{}={}", PROJECT_LABEL, project).as_str()]
                },
                ..Default::default()
            }))
            .await?)
    }

    async fn ensure_network(&self, project: &str, network: &str) -> Result<String> {
        let name = format!("{project}_{network}");
        match self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(Error::from)
        {
            Ok(_) => Ok(name),
            Err(Error::NotFound(_)) => {
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: name.as_str(),
                        driver: "bridge",
                        labels: hash_map! {
                            PROJECT_LABEL => project,
                            NETWORK_LABEL => network,
                            MANAGED_LABEL => "true"
                        },
                        ..Default::default()
                    })
                    .await?;
                info!("Network {} created", name);
                Ok(name)
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_volume(&self, project: &str, volume: &str) -> Result<()> {
        let name = format!("{project}_{volume}");
        match self.docker.inspect_volume(&name).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: name.as_str(),
                        driver: "local",
                        labels: hash_map! {
                            PROJECT_LABEL => project,
                            VOLUME_LABEL => volume,
                            MANAGED_LABEL => "true"
                        },
                        ..Default::default()
                    })
                    .await?;
                info!("Volume {} created", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Pulls the image only when the daemon does not have it yet. A pull
    /// through a mirror or another registry is tagged back to `image`.
    async fn ensure_image(&self, image: &str, pull: Option<&PullRequest>) -> Result<()> {
        match self.docker.inspect_image(image).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                let reference = pull.map_or(image, |pull| pull.reference.as_str());
                info!("Pull image {} as {}", image, reference);
                self.docker
                    .create_image(
                        Some(CreateImageOptions {
                            from_image: reference,
                            ..Default::default()
                        }),
                        None,
                        pull.and_then(docker_credentials),
                    )
                    .try_collect::<Vec<CreateImageInfo>>()
                    .await?;
                if reference != image && !image.contains('@') {
                    let (repo, tag) = split_target(image);
                    self.docker
                        .tag_image(reference, Some(TagImageOptions { repo, tag }))
                        .await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Force-removes a container with its anonymous volumes. Missing is fine.
    async fn discard_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Error::from)
        {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_service(
        &self,
        project: &str,
        spec: &ComposeProject,
        service: &ServiceSpec,
        pulls: &ImagePulls,
    ) -> Result<String> {
        let image = service
            .image
            .as_deref()
            .ok_or_else(|| Error::malformed(format!("services.{}.image", service.name), "missing"))?;
        self.ensure_image(image, pulls.get(image)).await?;

        let container_name = container_name(project, service);
        self.discard_container(&container_name).await?;

        let networks: Vec<String> = if service.networks.is_empty() {
            vec![format!("{project}_default")]
        } else {
            service
                .networks
                .iter()
                .map(|network| format!("{project}_{network}"))
                .collect()
        };
        let binds = service
            .volumes
            .iter()
            .map(|volume| {
                let source = if volume.is_named() && spec.volumes.contains(&volume.host) {
                    format!("{project}_{}", volume.host)
                } else {
                    volume.host.clone()
                };
                let mode = if volume.read_only { ":ro" } else { "" };
                format!("{source}:{}{mode}", volume.container)
            })
            .collect();
        let config = container_config(
            service,
            image,
            hash_map! {
                PROJECT_LABEL.to_string() => project.to_string(),
                SERVICE_LABEL.to_string() => service.name.clone(),
                MANAGED_LABEL.to_string() => "true".to_string()
            },
            binds,
            networks.first(),
        );

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for network in networks.iter().skip(1) {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: container.id.as_str(),
                        endpoint_config: endpoint(service),
                    },
                )
                .await?;
        }
        self.docker
            .start_container(container.id.as_str(), None::<StartContainerOptions<String>>)
            .await?;
        Ok(container.id)
    }

    /// Starts or stops every container of the project and reports per service.
    async fn each_container(&self, project: &str, verb: Verb) -> Result<Vec<ServiceOutcome>> {
        let containers = self.project_containers(project).await?;
        if containers.is_empty() {
            return Err(Error::not_found(format!("containers of project {project}")));
        }
        let mut outcomes = Vec::with_capacity(containers.len());
        for container in containers {
            let service = service_of(&container);
            let Some(id) = container.id else {
                continue;
            };
            let result = match verb {
                Verb::Start => {
                    self.docker
                        .start_container(&id, None::<StartContainerOptions<String>>)
                        .await
                }
                Verb::Stop => {
                    self.docker
                        .stop_container(&id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                        .await
                }
            };
            outcomes.push(match unless_already(result) {
                Ok(()) => ServiceOutcome::started(service),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("{:?} of {}/{} failed: {}", verb, project, service, e);
                    ServiceOutcome::failed(service, e.to_string())
                }
            });
        }
        Ok(outcomes)
    }
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Start,
    Stop,
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as Docker;
        match e {
            Docker::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            Docker::DockerResponseServerError {
                status_code,
                message,
            } => Error::RuntimeFailure(format!("{status_code} {message}")),
            Docker::RequestTimeoutError => Error::Timeout("docker daemon did not answer in time".into()),
            Docker::DockerStreamError { error } => Error::RuntimeFailure(error),
            e @ (Docker::JsonDataError { .. } | Docker::JsonSerdeError { .. }) => {
                Error::RuntimeFailure(e.to_string())
            }
            e => Error::RuntimeUnavailable(e.to_string()),
        }
    }
}

fn endpoint(service: &ServiceSpec) -> EndpointSettings {
    EndpointSettings {
        aliases: Some(vec![service.name.clone()]),
        ..Default::default()
    }
}

/// Container definition for one service; `network` is the one it joins at creation.
fn container_config(
    service: &ServiceSpec,
    image: &str,
    labels: HashMap<String, String>,
    binds: Vec<String>,
    network: Option<&String>,
) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        cmd: (!service.command.is_empty()).then(|| service.command.clone()),
        env: Some(
            service
                .environment
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
        ),
        labels: Some(labels),
        exposed_ports: Some(
            service
                .ports
                .iter()
                .map(|port| (format!("{}/tcp", port.container), HashMap::new()))
                .collect(),
        ),
        host_config: Some(HostConfig {
            port_bindings: Some(
                service
                    .ports
                    .iter()
                    .map(|port| (format!("{}/tcp", port.container), port.host))
                    .into_group_map()
                    .into_iter()
                    .map(|(container, hosts)| {
                        let bindings = hosts
                            .into_iter()
                            .map(|host| DockerPortBinding {
                                host_ip: None,
                                host_port: Some(host.to_string()),
                            })
                            .collect();
                        (container, Some(bindings))
                    })
                    .collect(),
            ),
            binds: Some(binds),
            restart_policy: service.restart.as_deref().and_then(restart_policy),
            network_mode: network.cloned(),
            ..Default::default()
        }),
        networking_config: network.map(|network| NetworkingConfig {
            endpoints_config: hash_map! { network.clone() => endpoint(service) },
        }),
        ..Default::default()
    }
}

/// Docker answers 304 when a container already is in the requested state.
fn unless_already(result: std::result::Result<(), bollard::errors::Error>) -> Result<()> {
    match result.map_err(Error::from) {
        Err(Error::RuntimeFailure(detail)) if detail.starts_with("304") => Ok(()),
        other => other,
    }
}

fn container_info(container: ContainerSummary) -> ContainerInfo {
    ContainerInfo {
        name: container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        project: container
            .labels
            .as_ref()
            .and_then(|labels| labels.get(PROJECT_LABEL).cloned()),
        state: ContainerState::parse(container.state.as_deref().unwrap_or_default()),
        status: container.status.unwrap_or_default(),
        image: container.image.unwrap_or_default(),
        id: container.id.unwrap_or_default(),
    }
}

/// Share of the host's CPU time, in percent, as `docker stats` computes it.
fn cpu_percent(container_delta: f64, system_delta: f64, cpus: f64) -> f64 {
    if container_delta > 0.0 && system_delta > 0.0 {
        container_delta / system_delta * cpus * 100.0
    } else {
        0.0
    }
}

fn container_stats(stats: Stats) -> ContainerStats {
    let container_delta =
        stats.cpu_stats.cpu_usage.total_usage as f64 - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
    ContainerStats {
        cpu_percent: cpu_percent(container_delta, system_delta, cpus),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        name: stats.name.trim_start_matches('/').to_string(),
        id: stats.id,
    }
}

fn network_listing_failure(project: &str, e: Error) -> ServiceFailure {
    ServiceFailure {
        service: format!("{project}_networks"),
        detail: e.to_string(),
    }
}

fn docker_credentials(request: &PullRequest) -> Option<DockerCredentials> {
    request.credentials.as_ref().map(|c| DockerCredentials {
        username: c.username.clone(),
        password: c.password.clone(),
        serveraddress: Some(c.server.clone()),
        ..Default::default()
    })
}

fn container_name(project: &str, service: &ServiceSpec) -> String {
    service
        .container_name
        .clone()
        .unwrap_or_else(|| format!("{project}-{}-1", service.name))
}

fn service_of(container: &ContainerSummary) -> String {
    container
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SERVICE_LABEL).cloned())
        .or_else(|| {
            container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
        })
        .unwrap_or_default()
}

fn restart_policy(policy: &str) -> Option<RestartPolicy> {
    let (name, retries) = match policy.split_once(':') {
        Some((name, retries)) => (name, retries.parse::<i64>().ok()),
        None => (policy, None),
    };
    let name = match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        other => {
            warn!("Ignoring unknown restart policy {}", other);
            return None;
        }
    };
    Some(RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    })
}

fn layer_phase(status: &str) -> Option<LayerPhase> {
    match status {
        "Pulling fs layer" | "Waiting" => Some(LayerPhase::Pending),
        "Downloading" => Some(LayerPhase::Downloading),
        "Verifying Checksum" | "Download complete" | "Extracting" => Some(LayerPhase::Verifying),
        "Pull complete" | "Already exists" => Some(LayerPhase::Complete),
        _ => None,
    }
}

/// Daemon progress line to a layer event. Lines about the whole image are dropped.
fn progress_event(info: CreateImageInfo) -> Option<Result<ProgressEvent>> {
    if let Some(error) = info.error {
        return Some(Err(Error::RuntimeFailure(error)));
    }
    let layer_id = info.id?;
    let phase = layer_phase(info.status.as_deref()?)?;
    let (done, total) = info
        .progress_detail
        .map(|detail| (detail.current.unwrap_or(0), detail.total.unwrap_or(0)))
        .unwrap_or((0, 0));
    Some(Ok(ProgressEvent {
        layer_id,
        phase,
        bytes_done: u64::try_from(done).unwrap_or(0),
        bytes_total: u64::try_from(total).unwrap_or(0),
    }))
}

fn log_lines(service: &str, output: LogOutput) -> Vec<LogLine> {
    let (stream, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        LogOutput::StdIn { .. } => return Vec::new(),
    };
    String::from_utf8_lossy(&message)
        .lines()
        .map(|line| LogLine {
            service: service.to_string(),
            stream: stream.clone(),
            message: line.to_string(),
        })
        .collect()
}

#[async_trait]
impl RuntimeControlPlane for DockerRuntime {
    async fn apply_project(
        &self,
        name: &str,
        project: &ComposeProject,
        pulls: &ImagePulls,
    ) -> Result<Vec<ServiceOutcome>> {
        self.ensure_network(name, "default").await?;
        for network in &project.networks {
            self.ensure_network(name, network).await?;
        }
        for volume in &project.volumes {
            self.ensure_volume(name, volume).await?;
        }

        let wanted: HashSet<&str> = project.services.iter().map(|s| s.name.as_str()).collect();
        for container in self.project_containers(name).await? {
            let service = service_of(&container);
            if wanted.contains(service.as_str()) {
                continue;
            }
            if let Some(id) = container.id {
                info!("Removing container {} of dropped service {}", id, service);
                self.discard_container(&id).await?;
            }
        }

        let mut outcomes = Vec::with_capacity(project.services.len());
        for service in &project.services {
            outcomes.push(match self.apply_service(name, project, service, pulls).await {
                Ok(id) => {
                    info!("Service {}/{} started as {}", name, service.name, id);
                    ServiceOutcome::started(service.name.as_str())
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Service {}/{} failed: {}", name, service.name, e);
                    ServiceOutcome::failed(service.name.as_str(), e.to_string())
                }
            });
        }
        Ok(outcomes)
    }

    async fn project_status(&self, name: &str) -> Result<Vec<ServiceStatus>> {
        let containers = self.project_containers(name).await?;
        Ok(containers
            .into_iter()
            .map(|container| ServiceStatus {
                service: service_of(&container),
                container_name: container
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: ContainerState::parse(container.state.as_deref().unwrap_or_default()),
                status: container.status.unwrap_or_default(),
                container_id: container.id.unwrap_or_default(),
            })
            .sorted_by(|a, b| a.service.cmp(&b.service))
            .collect())
    }

    async fn start_project(&self, name: &str) -> Result<Vec<ServiceOutcome>> {
        self.each_container(name, Verb::Start).await
    }

    async fn stop_project(&self, name: &str) -> Result<Vec<ServiceOutcome>> {
        self.each_container(name, Verb::Stop).await
    }

    async fn remove_project(&self, name: &str) -> Result<Vec<ServiceFailure>> {
        let mut failures = Vec::new();
        for container in self.project_containers(name).await? {
            let service = service_of(&container);
            let Some(id) = container.id else {
                continue;
            };
            if let Err(e) = self.discard_container(&id).await {
                warn!("Container {} of project {} not removed: {}", id, name, e);
                failures.push(ServiceFailure {
                    service,
                    detail: e.to_string(),
                });
            }
        }

        let networks = match self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: hash_map! {
                    "label" => vec![format!("{}={}", PROJECT_LABEL, name).as_str()]
                },
            }))
            .await
        {
            Ok(networks) => networks,
            Err(e) => {
                warn!("Networks of project {} not listed: {}", name, e);
                failures.push(network_listing_failure(name, Error::from(e)));
                return Ok(failures);
            }
        };
        for network in networks.into_iter().filter_map(|network| network.name) {
            if let Err(e) = self.docker.remove_network(&network).await.map_err(Error::from) {
                warn!("Network {} of project {} not removed: {}", network, name, e);
                failures.push(ServiceFailure {
                    service: network,
                    detail: e.to_string(),
                });
            }
        }
        Ok(failures)
    }

    async fn project_logs(&self, name: &str, tail: usize) -> Result<Vec<LogLine>> {
        let mut lines = Vec::new();
        for container in self.project_containers(name).await? {
            let service = service_of(&container);
            let Some(id) = container.id else {
                continue;
            };
            let output: Vec<LogOutput> = self
                .docker
                .logs(
                    &id,
                    Some(LogsOptions::<String> {
                        stdout: true,
                        stderr: true,
                        tail: tail.to_string(),
                        ..Default::default()
                    }),
                )
                .try_collect()
                .await?;
            lines.extend(output.into_iter().flat_map(|chunk| log_lines(&service, chunk)));
        }
        Ok(lines)
    }

    fn pull_image(&self, request: &PullRequest) -> BoxStream<'static, Result<ProgressEvent>> {
        let credentials = docker_credentials(request);
        debug!("Pulling {}", request.reference);
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: request.reference.clone(),
                    ..Default::default()
                }),
                None,
                credentials,
            )
            .filter_map(|info| {
                future::ready(match info {
                    Ok(info) => progress_event(info),
                    Err(e) => Some(Err(Error::from(e))),
                })
            })
            .boxed()
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;
        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image.repo_tags,
                size: image.size,
                created: image.created,
            })
            .collect())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        Ok(self
            .docker
            .tag_image(source, Some(TagImageOptions { repo, tag }))
            .await?)
    }

    async fn export_image(&self, reference: &str) -> Result<Bytes> {
        let archive = self
            .docker
            .export_image(reference)
            .map_err(Error::from)
            .try_fold(BytesMut::new(), |mut archive, chunk| async move {
                archive.extend_from_slice(&chunk);
                Ok(archive)
            })
            .await?;
        Ok(archive.freeze())
    }

    async fn import_image(&self, archive: Bytes) -> Result<()> {
        let results: Vec<_> = self
            .docker
            .import_image(ImportImageOptions { quiet: true }, archive, None)
            .try_collect()
            .await?;
        match results.into_iter().find_map(|info| info.error) {
            Some(error) => Err(Error::RuntimeFailure(error)),
            None => Ok(()),
        }
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks
            .into_iter()
            .map(|network| NetworkSummary {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<NetworkSummary> {
        self.docker
            .create_network(CreateNetworkOptions {
                name,
                driver: driver.unwrap_or("bridge"),
                labels: hash_map! { MANAGED_LABEL => "true" },
                ..Default::default()
            })
            .await?;
        let network = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(NetworkSummary {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_else(|| name.to_string()),
            driver: network.driver.unwrap_or_default(),
        })
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        Ok(self.docker.remove_network(name).await?)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeSummary {
                name: volume.name,
                driver: volume.driver,
                mountpoint: volume.mountpoint,
            })
            .collect())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeSummary> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name,
                driver: "local",
                labels: hash_map! { MANAGED_LABEL => "true" },
                ..Default::default()
            })
            .await?;
        Ok(VolumeSummary {
            name: volume.name,
            driver: volume.driver,
            mountpoint: volume.mountpoint,
        })
    }

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        Ok(self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await?)
    }

    async fn prune_volumes(&self) -> Result<PruneReport> {
        let response = self
            .docker
            .prune_volumes(None::<PruneVolumesOptions<String>>)
            .await?;
        Ok(PruneReport {
            deleted: response.volumes_deleted.unwrap_or_default(),
            space_reclaimed: response.space_reclaimed.unwrap_or(0),
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().map(container_info).collect())
    }

    async fn create_container(&self, spec: &ServiceSpec, pull: &PullRequest) -> Result<ContainerInfo> {
        let image = spec
            .image
            .as_deref()
            .ok_or_else(|| Error::malformed("image", "missing"))?;
        self.ensure_image(image, Some(pull)).await?;
        let name = spec.container_name.clone().unwrap_or_else(|| spec.name.clone());
        let binds = spec
            .volumes
            .iter()
            .map(|volume| {
                let mode = if volume.read_only { ":ro" } else { "" };
                format!("{}:{}{mode}", volume.host, volume.container)
            })
            .collect();
        let config = container_config(
            spec,
            image,
            hash_map! { MANAGED_LABEL.to_string() => "true".to_string() },
            binds,
            None,
        );
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!("Container {}: {}", name, warning);
        }
        Ok(ContainerInfo {
            id: created.id,
            name,
            image: image.to_string(),
            state: ContainerState::Created,
            status: "Created".to_string(),
            project: None,
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        unless_already(
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        unless_already(
            self.docker
                .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                .await,
        )
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        Ok(self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?)
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        let info = self.docker.info().await?;
        Ok(SystemInfo {
            server_version: info.server_version.unwrap_or_default(),
            operating_system: info.operating_system.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
            kernel_version: info.kernel_version.unwrap_or_default(),
            cpus: info.ncpu.unwrap_or(0),
            memory_total: info.mem_total.unwrap_or(0),
            containers: info.containers.unwrap_or(0),
            containers_running: info.containers_running.unwrap_or(0),
            containers_stopped: info.containers_stopped.unwrap_or(0),
            images: info.images.unwrap_or(0),
            system_time: info.system_time.unwrap_or_default(),
        })
    }

    async fn container_stats(&self) -> Result<Vec<ContainerStats>> {
        let mut all = Vec::new();
        for container in self.list_containers(false).await? {
            let sample = self
                .docker
                .stats(
                    &container.id,
                    Some(StatsOptions {
                        stream: false,
                        one_shot: false,
                    }),
                )
                .try_next()
                .await
                .map_err(Error::from);
            match sample {
                Ok(Some(stats)) => all.push(container_stats(stats)),
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(e),
                // The container may have stopped since it was listed.
                Err(e) => warn!("No stats for container {}: {}", container.name, e),
            }
        }
        Ok(all)
    }
}
