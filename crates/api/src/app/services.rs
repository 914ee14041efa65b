//! Infrastructure wiring: store selection, ingestion, workers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hookrelay_infra::{
    AppConfig, Clock, EventStore, EventStoreError, InMemoryEventStore, IngestionService,
    PostgresEventStore, Processor, RetryStrategy, SystemClock, WorkerHandle, WorkerLoop,
};

pub type DynStore = Arc<dyn EventStore>;

/// Shared services handed to every request handler.
pub struct AppServices {
    pub store: DynStore,
    pub ingestion: IngestionService<DynStore>,
    postgres: Option<PostgresEventStore>,
    clock: Arc<dyn Clock>,
    retry: Arc<RetryStrategy>,
}

impl AppServices {
    /// Postgres when `DATABASE_URL` is configured, in-memory otherwise.
    pub async fn from_config(config: &AppConfig) -> Result<Self, EventStoreError> {
        match config.database_url.as_deref() {
            Some(url) => Self::postgres(config, url).await,
            None => {
                warn!("DATABASE_URL not set; using in-memory store (events are lost on restart)");
                Ok(Self::in_memory(config))
            }
        }
    }

    /// Connect, create the schema if needed and wire services on top.
    pub async fn postgres(config: &AppConfig, database_url: &str) -> Result<Self, EventStoreError> {
        let store = PostgresEventStore::connect(database_url, config.database_max_connections).await?;
        store.ensure_schema().await?;
        info!(max_connections = config.database_max_connections, "connected to postgres");

        let mut services = Self::with_store(Arc::new(store.clone()), Arc::new(SystemClock), config);
        services.postgres = Some(store);
        Ok(services)
    }

    pub fn in_memory(config: &AppConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryEventStore::with_clock(clock.clone()));
        Self::with_store(store, clock, config)
    }

    pub fn with_store(store: DynStore, clock: Arc<dyn Clock>, config: &AppConfig) -> Self {
        let ingestion = IngestionService::with_clock(store.clone(), clock.clone())
            .with_max_attempts(config.max_attempts);
        let retry = RetryStrategy::with_clock(config.retry, clock.clone());
        Self {
            store,
            ingestion,
            postgres: None,
            clock,
            retry: Arc::new(retry),
        }
    }

    /// Spawn `config.worker_count` independent worker loops under `token`.
    pub fn spawn_workers(
        &self,
        config: &AppConfig,
        processor: Arc<dyn Processor>,
        token: &CancellationToken,
    ) -> Vec<WorkerHandle> {
        (0..config.worker_count)
            .map(|i| {
                WorkerLoop::new(
                    self.store.clone(),
                    processor.clone(),
                    self.retry.clone(),
                    self.clock.clone(),
                    config.worker_config(i),
                )
                .spawn(token)
            })
            .collect()
    }

    /// Release the database pool, if any.
    pub async fn close(&self) {
        if let Some(pg) = &self.postgres {
            pg.close().await;
            info!("postgres pool closed");
        }
    }
}
