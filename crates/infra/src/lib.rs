//! Infrastructure layer: event storage, ingestion, retry scheduling and workers.

pub mod clock;
pub mod config;
pub mod ingest;
pub mod processor;
pub mod retry;
pub mod store;
pub mod worker;

pub use clock::{Clock, SystemClock, TestClock};
pub use config::{AppConfig, ConfigError};
pub use ingest::{IngestError, IngestOutcome, IngestionService};
pub use processor::{ProcessOutcome, Processor, SimulatedProcessor};
pub use retry::{RetryConfig, RetryStrategy};
pub use store::{ClaimOutcome, EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, StatusCounts};
pub use worker::{Tick, WorkerConfig, WorkerHandle, WorkerLoop, WorkerStats};

#[cfg(test)]
mod integration_tests;
