use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use split_iter::Splittable;

use super::error::{validate_name, Error, Result};
use super::locks::{KeyGuard, KeyedLocks};
use super::manifest::{ComposeProject, Manifest};
use super::model::{
    ContainerState, ImagePulls, Listing, LogLine, Project, ProjectReport, ProjectState, ServiceFailure,
    ServiceOutcome, ServiceStatus,
};
use super::port::RuntimeControlPlane;
use super::project_registry::ProjectRegistry;
use super::registry_config::{RegistryConfigManager, RegistryHint};
use super::template_store::TemplateStore;
use super::translator;

#[derive(Debug, Clone)]
pub enum DeploySource {
    Template(String),
    Manifest(Manifest),
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub fast: Duration,
    pub long: Duration,
}

/// Drives projects through their lifecycle against the runtime.
///
/// At most one verb runs per project name; a second one is refused with
/// `ProjectBusy` instead of queued. `status` is read-only and never waits.
pub struct LifecycleOrchestrator {
    runtime: Arc<dyn RuntimeControlPlane>,
    projects: Arc<ProjectRegistry>,
    templates: Arc<TemplateStore>,
    registry: Arc<RegistryConfigManager>,
    busy: KeyedLocks,
    timeouts: Timeouts,
    require_mirror: bool,
}

impl LifecycleOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeControlPlane>,
        projects: Arc<ProjectRegistry>,
        templates: Arc<TemplateStore>,
        registry: Arc<RegistryConfigManager>,
        timeouts: Timeouts,
        require_mirror: bool,
    ) -> Self {
        Self {
            runtime,
            projects,
            templates,
            registry,
            busy: KeyedLocks::new(),
            timeouts,
            require_mirror,
        }
    }

    pub async fn list(&self) -> Result<Listing<Project>> {
        let mut listing = self.projects.list().await?;
        listing.items.retain(|project| project.last_known_state.is_active());
        Ok(listing)
    }

    pub async fn deploy(&self, name: &str, source: DeploySource) -> Result<ProjectReport> {
        validate_name(name)?;
        let (manifest, template_id) = match source {
            DeploySource::Template(id) => {
                let template = self.templates.get(&id).await?;
                (translator::to_manifest(&template), Some(id))
            }
            DeploySource::Manifest(manifest) => (manifest, None),
        };
        let compose = ComposeProject::from_manifest(&manifest)?;
        compose.require_deployable()?;
        let pulls = self.resolve_pulls(&compose).await?;

        let _guard = self.guard(name)?;
        match self.projects.resolve(name).await {
            Ok(existing) => {
                if existing.last_known_state == ProjectState::Running && existing.manifest == manifest {
                    let services = self
                        .bounded(name, "status", self.timeouts.fast, self.runtime.project_status(name))
                        .await?;
                    if !services.is_empty()
                        && services.iter().all(|s| s.state == ContainerState::Running)
                    {
                        info!("Project {} is up-to-date", name);
                        return self.record(name, ProjectState::Running, services, Vec::new()).await;
                    }
                }
                self.projects.replace_manifest(name, manifest, template_id).await?;
            }
            Err(Error::NotFound(_)) => {
                self.projects.register(name, template_id, manifest).await?;
            }
            Err(e) => return Err(e),
        }

        self.projects
            .update_state(name, ProjectState::Deploying, Utc::now())
            .await?;
        info!("Deploying project {} ({} services)", name, compose.services.len());
        let outcomes = self
            .bounded(name, "deploy", self.timeouts.long, self.runtime.apply_project(name, &compose, &pulls))
            .await?;
        self.settle(name, outcomes, true).await
    }

    pub async fn start(&self, name: &str) -> Result<ProjectReport> {
        let _guard = self.guard(name)?;
        self.projects.resolve(name).await?;
        let outcomes = self
            .bounded(name, "start", self.timeouts.fast, self.runtime.start_project(name))
            .await?;
        self.settle(name, outcomes, false).await
    }

    pub async fn stop(&self, name: &str) -> Result<ProjectReport> {
        let _guard = self.guard(name)?;
        self.projects.resolve(name).await?;
        let outcomes = self
            .bounded(name, "stop", self.timeouts.fast, self.runtime.stop_project(name))
            .await?;
        self.settle(name, outcomes, false).await
    }

    pub async fn restart(&self, name: &str) -> Result<ProjectReport> {
        let _guard = self.guard(name)?;
        self.projects.resolve(name).await?;
        let stopped = self
            .bounded(name, "stop", self.timeouts.fast, self.runtime.stop_project(name))
            .await?;
        for outcome in stopped.iter().filter(|o| o.error.is_some()) {
            warn!("Project {} service {} did not stop cleanly", name, outcome.service);
        }
        self.projects
            .update_state(name, ProjectState::Stopped, Utc::now())
            .await?;
        let outcomes = self
            .bounded(name, "start", self.timeouts.fast, self.runtime.start_project(name))
            .await?;
        self.settle(name, outcomes, false).await
    }

    /// Tears the project down and records it as Removed, whatever the
    /// runtime says. Named volumes survive.
    pub async fn remove(&self, name: &str) -> Result<Project> {
        let _guard = self.guard(name)?;
        self.projects.get(name).await?;
        let teardown = match tokio::time::timeout(self.timeouts.long, self.runtime.remove_project(name)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(name, "remove", self.timeouts.long)),
        };
        let project = self.projects.remove(name).await?;
        match teardown {
            Ok(failures) if failures.is_empty() => {
                info!("Project {} removed", name);
                Ok(project)
            }
            Ok(failures) => {
                warn!(
                    "Project {} removed with {} teardown failures",
                    name,
                    failures.len()
                );
                Err(Error::PartialFailure {
                    detail: format!("project {name} removed, some resources remain"),
                    failures,
                })
            }
            Err(e) => {
                warn!("Project {} removed without runtime teardown: {}", name, e);
                Err(e)
            }
        }
    }

    /// Fresh runtime view. A deploy in flight keeps its Deploying state; a
    /// Deploying record that no verb holds is an interrupted deploy.
    pub async fn status(&self, name: &str) -> Result<ProjectReport> {
        let project = self.projects.resolve(name).await?;
        let services = with_timeout(
            self.timeouts.fast,
            self.runtime.project_status(name),
            || self.timeout_error(name, "status", self.timeouts.fast),
        )
        .await?;
        let deploying = project.last_known_state == ProjectState::Deploying;
        if deploying && self.busy.is_locked(name) {
            return Ok(ProjectReport {
                name: name.to_string(),
                state: ProjectState::Deploying,
                observed_at: Utc::now(),
                services,
                failures: Vec::new(),
            });
        }
        if deploying {
            warn!("Project {} was left deploying, re-deriving its state", name);
        }
        let state = derive_state(&services, &[], deploying);
        self.record(name, state, services, Vec::new()).await
    }

    pub async fn logs(&self, name: &str, tail: usize) -> Result<Vec<LogLine>> {
        self.projects.resolve(name).await?;
        with_timeout(
            self.timeouts.fast,
            self.runtime.project_logs(name, tail),
            || self.timeout_error(name, "logs", self.timeouts.fast),
        )
        .await
    }

    pub async fn get_manifest(&self, name: &str) -> Result<String> {
        self.projects.resolve(name).await?.manifest.to_yaml()
    }

    /// Replaces the stored manifest. Takes effect on the next deploy.
    pub async fn set_manifest(&self, name: &str, text: &str) -> Result<Project> {
        let manifest = Manifest::parse(text)?;
        translator::to_template(&manifest, Some(name))?;
        let _guard = self.guard(name)?;
        let project = self.projects.resolve(name).await?;
        let project = self
            .projects
            .replace_manifest(name, manifest, project.source_template_id)
            .await?;
        info!("Project {} manifest replaced", name);
        Ok(project)
    }

    /// Registry settings apply to the images a deploy fetches as well.
    async fn resolve_pulls(&self, compose: &ComposeProject) -> Result<ImagePulls> {
        let hint = RegistryHint::parse(None, self.require_mirror);
        let mut pulls = ImagePulls::new();
        for image in compose.services.iter().filter_map(|service| service.image.as_deref()) {
            if !pulls.contains_key(image) {
                let pull = self.registry.resolve_pull(image, &hint).await?;
                pulls.insert(image.to_string(), pull);
            }
        }
        Ok(pulls)
    }

    fn guard(&self, name: &str) -> Result<KeyGuard<'_>> {
        self.busy
            .try_lock(name)
            .ok_or_else(|| Error::ProjectBusy(name.to_string()))
    }

    fn timeout_error(&self, name: &str, verb: &str, bound: Duration) -> Error {
        Error::Timeout(format!("{verb} of project {name} exceeded {bound:?}"))
    }

    /// Runs a runtime call under `bound`. Any failure marks the project Failed.
    async fn bounded<T>(
        &self,
        name: &str,
        verb: &str,
        bound: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = with_timeout(bound, call, || self.timeout_error(name, verb, bound)).await;
        if let Err(e) = &result {
            warn!("Project {} {} failed: {}", name, verb, e);
            if let Err(write) = self
                .projects
                .update_state(name, ProjectState::Failed, Utc::now())
                .await
            {
                warn!("Project {} state could not be recorded: {}", name, write);
            }
        }
        result
    }

    /// Re-reads runtime truth after a verb and records the derived state.
    async fn settle(
        &self,
        name: &str,
        outcomes: Vec<ServiceOutcome>,
        deploying: bool,
    ) -> Result<ProjectReport> {
        let (failures, succeeded) = {
            let (failed, succeeded) = outcomes.into_iter().split(|o| o.error.is_none());
            let failures: Vec<ServiceFailure> = failed
                .map(|o| ServiceFailure {
                    service: o.service,
                    detail: o.error.unwrap_or_default(),
                })
                .collect();
            (failures, succeeded.count())
        };
        if !failures.is_empty() {
            warn!(
                "Project {}: {} services ok, {} failed",
                name,
                succeeded,
                failures.len()
            );
        }
        let services = self
            .bounded(name, "status", self.timeouts.fast, self.runtime.project_status(name))
            .await?;
        let state = derive_state(&services, &failures, deploying);
        self.record(name, state, services, failures).await
    }

    async fn record(
        &self,
        name: &str,
        state: ProjectState,
        services: Vec<ServiceStatus>,
        failures: Vec<ServiceFailure>,
    ) -> Result<ProjectReport> {
        let project = self.projects.update_state(name, state, Utc::now()).await?;
        Ok(ProjectReport {
            name: project.name,
            state: project.last_known_state,
            observed_at: project.last_observed_at,
            services,
            failures,
        })
    }
}

async fn with_timeout<T>(
    bound: Duration,
    call: impl Future<Output = Result<T>>,
    on_timeout: impl FnOnce() -> Error,
) -> Result<T> {
    match tokio::time::timeout(bound, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// Project state as implied by the runtime's view of its containers.
fn derive_state(services: &[ServiceStatus], failures: &[ServiceFailure], deploying: bool) -> ProjectState {
    let running = services
        .iter()
        .filter(|s| s.state == ContainerState::Running)
        .count();
    if running > 0 && running == services.len() && failures.is_empty() {
        ProjectState::Running
    } else if running > 0 {
        ProjectState::PartiallyRunning
    } else if deploying || services.iter().any(|s| s.state == ContainerState::Dead) {
        ProjectState::Failed
    } else {
        ProjectState::Stopped
    }
}
