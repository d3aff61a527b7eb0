use std::sync::Arc;

use lifecycle::{LifecycleOrchestrator, Timeouts};
use port::{RecordStore, RuntimeControlPlane};
use project_registry::ProjectRegistry;
use pull::{PullSettings, StreamingOperationManager};
use registry_config::RegistryConfigManager;
use resources::ResourceService;
use template_store::TemplateStore;

pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod manifest;
pub mod model;
pub mod port;
pub mod project_registry;
pub mod pull;
pub mod registry_config;
pub mod resources;
pub mod template_store;
pub mod translator;

#[cfg(test)]
pub mod testing;

/// Every component, wired over one runtime and one record store.
pub struct Services {
    pub templates: Arc<TemplateStore>,
    pub lifecycle: LifecycleOrchestrator,
    pub pulls: StreamingOperationManager,
    pub registry: Arc<RegistryConfigManager>,
    pub resources: ResourceService,
}

impl Services {
    pub fn new(
        runtime: Arc<dyn RuntimeControlPlane>,
        records: Arc<dyn RecordStore>,
        registry: RegistryConfigManager,
        timeouts: Timeouts,
        pull: PullSettings,
    ) -> Self {
        let templates = Arc::new(TemplateStore::new(Arc::clone(&records)));
        let projects = Arc::new(ProjectRegistry::new(records));
        let registry = Arc::new(registry);
        let require_mirror = pull.require_mirror;
        Self {
            lifecycle: LifecycleOrchestrator::new(
                Arc::clone(&runtime),
                projects,
                Arc::clone(&templates),
                Arc::clone(&registry),
                timeouts,
                require_mirror,
            ),
            pulls: StreamingOperationManager::new(Arc::clone(&runtime), Arc::clone(&registry), pull),
            resources: ResourceService::new(runtime, Arc::clone(&registry), timeouts, require_mirror),
            templates,
            registry,
        }
    }
}
