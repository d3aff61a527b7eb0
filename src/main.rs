use std::sync::Arc;

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::info;
use tokio::net::TcpListener;

use crate::config::{load_config, StorageKind};
use crate::domain::{port::RecordStore, registry_config::RegistryConfigManager, Services};
use crate::infra::{
    docker::DockerRuntime, fs_store::FileRecordStore, memory_store::MemoryRecordStore, web::router,
};

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start stackyard - compose templates and projects over Docker");

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let docker = Docker::connect_with_socket(
        &config.docker.socket,
        config.docker.connect_timeout_secs,
        API_DEFAULT_VERSION,
    )
    .context("Can't connect to docker socket")?;

    let records: Arc<dyn RecordStore> = match config.storage {
        StorageKind::File => Arc::new(
            FileRecordStore::open(&config.data_dir)
                .await
                .with_context(|| format!("Can't open data directory {}", config.data_dir.display()))?,
        ),
        StorageKind::Memory => Arc::new(MemoryRecordStore::new()),
    };
    let registry = RegistryConfigManager::load(Arc::clone(&records), config.registry.daemon_config_path.clone())
        .await
        .context("Can't load registry configuration")?;

    let services = Services::new(
        Arc::new(DockerRuntime::new(docker)),
        records,
        registry,
        config.timeouts(),
        config.pull_settings(),
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen))?;
    info!("Listening on {}", config.listen);
    axum::serve(listener, router(Arc::new(services))).await?;
    Ok(())
}
