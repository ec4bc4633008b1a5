//! Orchestrator bootstrap.

use std::sync::Arc;

use actors::{
    EmbeddedStore, HttpRemoteStore, OrchestratorConfig, RemoteStore, Services, StoreConfig,
    start_dispatcher, start_orchestrator,
};

use crate::error::ApiError;
use crate::jobs::JobService;

/// Start the orchestrator for `config`.
///
/// Connects the remote store, starts the actors, recovers work left by a
/// previous run and only then starts dispatching.
pub async fn init_orchestrator(config: OrchestratorConfig) -> Result<JobService, ApiError> {
    config.validate()?;
    tracing::info!(
        "Initializing orchestrator in {}",
        config.data_dir.display()
    );

    let store = connect_store(&config.store).await?;
    start_services(Arc::new(Services::new(config, store))).await
}

/// Build the remote store client selected by `config`.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn RemoteStore>, ApiError> {
    match config {
        StoreConfig::Http {
            base_url,
            api_key,
            timeout,
        } => {
            tracing::info!("Using remote store at {}", base_url);
            let mut store = HttpRemoteStore::new(base_url.clone(), *timeout)?;
            if let Some(key) = api_key {
                store = store.with_api_key(key.clone());
            }
            Ok(Arc::new(store))
        }
        StoreConfig::Embedded(db_config) => {
            tracing::info!("Using embedded store at {}", db_config.endpoint);
            let db = db::init(db_config.clone()).await?;
            Ok(Arc::new(EmbeddedStore::new(db)))
        }
    }
}

/// Start actors on prepared services.
pub async fn start_services(services: Arc<Services>) -> Result<JobService, ApiError> {
    let (orchestrator, _) = start_orchestrator(services.clone())
        .await
        .map_err(|e| ApiError::Unavailable(format!("orchestrator failed to start: {}", e)))?;

    let report = actors::recover(&services, &orchestrator).await;
    tracing::debug!("Recovery report: {:?}", report);

    let (dispatcher, _) = start_dispatcher(orchestrator.clone(), services.clone())
        .await
        .map_err(|e| ApiError::Unavailable(format!("dispatcher failed to start: {}", e)))?;

    let sweeper = services
        .gateway
        .spawn_sweeper(services.config.persistence.sweep_interval);

    tracing::info!("Orchestrator initialized");
    Ok(JobService::new(
        services,
        orchestrator,
        dispatcher,
        sweeper.abort_handle(),
    ))
}
