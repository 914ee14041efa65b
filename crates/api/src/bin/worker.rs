//! Standalone worker process: runs `WORKER_COUNT` loops against Postgres.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use hookrelay_api::app::AppServices;
use hookrelay_api::server::{drain_workers, shutdown_signal};
use hookrelay_infra::{AppConfig, ConfigError, SimulatedProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hookrelay_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let database_url = config
        .database_url
        .clone()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;

    let services = AppServices::postgres(&config, &database_url)
        .await
        .context("failed to connect to postgres")?;

    let token = CancellationToken::new();
    let workers = services.spawn_workers(&config, Arc::new(SimulatedProcessor::new()), &token);
    tracing::info!(count = workers.len(), "workers running");

    shutdown_signal(token).await;
    drain_workers(workers).await;
    services.close().await;
    Ok(())
}
