use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use hookrelay_api::app::{build_app, AppServices};
use hookrelay_api::server::{drain_workers, shutdown_signal};
use hookrelay_infra::{AppConfig, SimulatedProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hookrelay_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        AppServices::from_config(&config)
            .await
            .context("failed to initialise event store")?,
    );

    let token = CancellationToken::new();
    let workers = if config.embedded_worker {
        tracing::info!(count = config.worker_count, "starting embedded workers");
        services.spawn_workers(&config, Arc::new(SimulatedProcessor::new()), &token)
    } else {
        Vec::new()
    };

    let app = build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await
        .context("server error")?;

    token.cancel();
    drain_workers(workers).await;
    services.close().await;
    Ok(())
}
