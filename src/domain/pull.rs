//! Long-running image pulls with observable progress.
//!
//! Each pull runs in its own task. Subscribers read the operation's event
//! log from the position they joined at; a `watch` counter wakes them when
//! the log grows or the pull reaches a terminal outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use log::{info, warn};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{Error, Result};
use super::model::{ProgressEvent, PullEvent, PullOutcome, PullRequest, PullStatus, PullSummary};
use super::port::RuntimeControlPlane;
use super::registry_config::{RegistryConfigManager, RegistryHint};

#[derive(Debug, Clone)]
pub struct PullSettings {
    pub max_retries: u32,
    pub backoff: Duration,
    pub retention: Duration,
    pub timeout: Duration,
    pub require_mirror: bool,
}

struct PullState {
    status: PullStatus,
    events: Vec<ProgressEvent>,
    outcome: Option<PullOutcome>,
}

struct PullOperation {
    id: String,
    image_name: String,
    registry_hint: Option<String>,
    token: CancellationToken,
    state: Mutex<PullState>,
    changed: watch::Sender<u64>,
}

impl PullOperation {
    fn state(&self) -> MutexGuard<'_, PullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn set_running(&self) {
        self.state().status = PullStatus::Running;
        self.notify();
    }

    fn record(&self, event: ProgressEvent) {
        self.state().events.push(event);
        self.notify();
    }

    fn finish(&self, outcome: PullOutcome) {
        {
            let mut state = self.state();
            state.status = outcome.status();
            state.outcome = Some(outcome);
        }
        self.notify();
    }

    fn summary(&self) -> PullSummary {
        let state = self.state();
        PullSummary {
            id: self.id.clone(),
            image_name: self.image_name.clone(),
            registry_hint: self.registry_hint.clone(),
            status: state.status,
            events: state.events.len(),
            failure: match &state.outcome {
                Some(PullOutcome::Failed { detail }) => Some(detail.clone()),
                _ => None,
            },
        }
    }
}

pub struct StreamingOperationManager {
    runtime: Arc<dyn RuntimeControlPlane>,
    registry: Arc<RegistryConfigManager>,
    operations: Arc<DashMap<String, Arc<PullOperation>>>,
    settings: PullSettings,
}

impl StreamingOperationManager {
    pub fn new(
        runtime: Arc<dyn RuntimeControlPlane>,
        registry: Arc<RegistryConfigManager>,
        settings: PullSettings,
    ) -> Self {
        Self {
            runtime,
            registry,
            operations: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Checks preconditions, then starts the pull in the background.
    /// Nothing is spawned when a precondition fails.
    pub async fn start_pull(&self, image: &str, registry_hint: Option<&str>) -> Result<String> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::malformed("image", "an image reference is required"));
        }
        let hint = RegistryHint::parse(registry_hint, self.settings.require_mirror);
        let request = self.registry.resolve_pull(image, &hint).await?;

        let (changed, _) = watch::channel(0);
        let operation = Arc::new(PullOperation {
            id: Uuid::new_v4().to_string(),
            image_name: image.to_string(),
            registry_hint: registry_hint.map(str::to_string),
            token: CancellationToken::new(),
            state: Mutex::new(PullState {
                status: PullStatus::Queued,
                events: Vec::new(),
                outcome: None,
            }),
            changed,
        });
        let id = operation.id.clone();
        self.operations.insert(id.clone(), Arc::clone(&operation));
        info!("Pull {} of {} started as {}", id, image, request.reference);

        tokio::spawn(run(
            operation,
            request,
            Arc::clone(&self.runtime),
            Arc::clone(&self.operations),
            self.settings.clone(),
        ));
        Ok(id)
    }

    /// Progress from now on, then exactly one terminal event.
    pub fn subscribe(&self, id: &str) -> Result<BoxStream<'static, PullEvent>> {
        let operation = self.lookup(id)?;
        let changes = operation.changed.subscribe();
        let position = operation.state().events.len();
        Ok(stream::unfold(
            Some((operation, changes, position)),
            |cursor| async move {
                let (operation, mut changes, mut position) = cursor?;
                loop {
                    changes.borrow_and_update();
                    let next = {
                        let state = operation.state();
                        if let Some(event) = state.events.get(position) {
                            position += 1;
                            Some(PullEvent::Progress(event.clone()))
                        } else {
                            state.outcome.clone().map(PullEvent::Finished)
                        }
                    };
                    match next {
                        Some(PullEvent::Finished(outcome)) => {
                            return Some((PullEvent::Finished(outcome), None));
                        }
                        Some(event) => return Some((event, Some((operation, changes, position)))),
                        None => {
                            if changes.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        )
        .boxed())
    }

    /// Requests cancellation. A finished pull is left as it is.
    pub fn cancel(&self, id: &str) -> Result<PullSummary> {
        let operation = self.lookup(id)?;
        if !operation.state().status.is_terminal() {
            info!("Pull {} cancellation requested", id);
            operation.token.cancel();
        }
        Ok(operation.summary())
    }

    pub fn get(&self, id: &str) -> Result<PullSummary> {
        Ok(self.lookup(id)?.summary())
    }

    pub fn list(&self) -> Vec<PullSummary> {
        let mut summaries: Vec<PullSummary> = self
            .operations
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.image_name.cmp(&b.image_name).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    fn lookup(&self, id: &str) -> Result<Arc<PullOperation>> {
        self.operations
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(format!("pull operation {id}")))
    }
}

async fn run(
    operation: Arc<PullOperation>,
    request: PullRequest,
    runtime: Arc<dyn RuntimeControlPlane>,
    operations: Arc<DashMap<String, Arc<PullOperation>>>,
    settings: PullSettings,
) {
    operation.set_running();
    let outcome = tokio::select! {
        biased;
        _ = operation.token.cancelled() => PullOutcome::Cancelled,
        result = tokio::time::timeout(
            settings.timeout,
            pull_with_retries(&operation, runtime.as_ref(), &request, &settings),
        ) => match result {
            Ok(Ok(())) => PullOutcome::Succeeded,
            Ok(Err(e)) => PullOutcome::Failed { detail: e.to_string() },
            Err(_) => PullOutcome::Failed {
                detail: Error::Timeout(format!("pull of {} exceeded {:?}", request.reference, settings.timeout))
                    .to_string(),
            },
        },
    };
    info!("Pull {} finished: {:?}", operation.id, outcome);
    operation.finish(outcome);

    tokio::time::sleep(settings.retention).await;
    operations.remove(&operation.id);
}

async fn pull_with_retries(
    operation: &PullOperation,
    runtime: &dyn RuntimeControlPlane,
    request: &PullRequest,
    settings: &PullSettings,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let mut progress = runtime.pull_image(request);
        let failure = loop {
            match progress.next().await {
                Some(Ok(event)) => operation.record(event),
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };
        match failure {
            None => return Ok(()),
            Some(e) if e.is_transient() && attempt < settings.max_retries => {
                attempt += 1;
                let delay = backoff(settings.backoff, attempt);
                warn!(
                    "Pull {} attempt {} failed ({}), retrying in {:?}",
                    operation.id, attempt, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Some(e) => return Err(e),
        }
    }
}

/// Exponential delay for the given retry, plus up to half the base as jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(1 << (attempt - 1).min(16));
    let jitter_cap = base.as_millis() as u64 / 2;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    exponential + Duration::from_millis(jitter)
}
