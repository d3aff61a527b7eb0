use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use super::error::{validate_name, Error, Result};
use super::locks::KeyedLocks;
use super::manifest::Manifest;
use super::model::{Listing, Project, ProjectState};
use super::port::RecordStore;

const NAMESPACE: &str = "projects";

/// Named projects and their last observed state.
///
/// The cached state is advisory: it is written back by the lifecycle
/// orchestrator after each runtime interaction and never consulted for
/// correctness decisions. Removed projects stay as tombstones until the name
/// is registered again.
pub struct ProjectRegistry {
    records: Arc<dyn RecordStore>,
    locks: KeyedLocks,
}

impl ProjectRegistry {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn register(
        &self,
        name: &str,
        source_template_id: Option<String>,
        manifest: Manifest,
    ) -> Result<Project> {
        validate_name(name)?;
        let _guard = self.locks.lock(name).await;
        if let Some(existing) = self.load(name).await? {
            if existing.last_known_state.is_active() {
                return Err(Error::DuplicateName(name.to_string()));
            }
        }
        let now = Utc::now();
        let project = Project {
            name: name.to_string(),
            source_template_id,
            manifest,
            last_known_state: ProjectState::Unknown,
            last_observed_at: now,
            created_at: now,
        };
        self.store(&project).await?;
        info!("Project {} registered", name);
        Ok(project)
    }

    /// Active project by name. Tombstones resolve to `NotFound`.
    pub async fn resolve(&self, name: &str) -> Result<Project> {
        match self.load(name).await? {
            Some(project) if project.last_known_state.is_active() => Ok(project),
            _ => Err(Error::not_found(format!("project {name}"))),
        }
    }

    /// Any record under `name`, tombstones included.
    pub async fn get(&self, name: &str) -> Result<Project> {
        self.load(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {name}")))
    }

    pub async fn list(&self) -> Result<Listing<Project>> {
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        for (key, data) in self.records.list(NAMESPACE).await? {
            match decode(&key, &data) {
                Ok(project) => items.push(project),
                Err(reason) => {
                    warn!("Skipping project record {}: {}", key, reason);
                    warnings.push(format!("project {key}: {reason}"));
                }
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Listing { items, warnings })
    }

    pub(super) async fn update_state(
        &self,
        name: &str,
        state: ProjectState,
        observed_at: DateTime<Utc>,
    ) -> Result<Project> {
        self.modify(name, |project| {
            if project.last_known_state != state {
                info!(
                    "Project {} {:?} -> {:?}",
                    name, project.last_known_state, state
                );
            }
            project.last_known_state = state;
            project.last_observed_at = observed_at;
        })
        .await
    }

    pub async fn replace_manifest(
        &self,
        name: &str,
        manifest: Manifest,
        source_template_id: Option<String>,
    ) -> Result<Project> {
        self.modify(name, move |project| {
            project.manifest = manifest;
            project.source_template_id = source_template_id;
        })
        .await
    }

    pub(super) async fn remove(&self, name: &str) -> Result<Project> {
        self.update_state(name, ProjectState::Removed, Utc::now()).await
    }

    async fn modify(&self, name: &str, change: impl FnOnce(&mut Project)) -> Result<Project> {
        let _guard = self.locks.lock(name).await;
        let mut project = self
            .load(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {name}")))?;
        change(&mut project);
        self.store(&project).await?;
        Ok(project)
    }

    async fn load(&self, name: &str) -> Result<Option<Project>> {
        match self.records.load(NAMESPACE, name).await? {
            Some(data) => decode(name, &data)
                .map(Some)
                .map_err(|reason| Error::storage(format!("project {name}: {reason}"))),
            None => Ok(None),
        }
    }

    async fn store(&self, project: &Project) -> Result<()> {
        let data = serde_json::to_vec_pretty(project)
            .map_err(|e| Error::storage(format!("cannot encode project {}: {e}", project.name)))?;
        self.records.save(NAMESPACE, &project.name, &data).await
    }
}

fn decode(key: &str, data: &[u8]) -> std::result::Result<Project, String> {
    let project: Project = serde_json::from_slice(data).map_err(|e| e.to_string())?;
    if project.name != key {
        return Err(format!("record claims name {:?}", project.name));
    }
    Ok(project)
}
