//! Fine-tuning orchestrator daemon.
//!
//! Reads its configuration from `TUNEQ_*` environment variables, recovers
//! jobs left by the previous run and dispatches queued jobs until
//! interrupted.

use actors::OrchestratorConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), api::ApiError> {
    let config = OrchestratorConfig::from_env()?;
    tracing::info!("Data directory: {}", config.data_dir.display());

    let service = api::init_orchestrator(config).await?;
    let queue = service.list_queue().await?;
    tracing::info!(
        "Orchestrator ready ({} queued, active: {:?})",
        queue.entries.len(),
        queue.active
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");
    service.shutdown().await
}
