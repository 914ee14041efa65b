//! Background worker: claim, attempt, finalize, pause.
//!
//! A worker is strictly sequential. Run more of them (in this process or
//! others) against the same store to scale; claim exclusivity comes from the
//! store alone.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hookrelay_core::{Event, EventId, DEFAULT_MAX_ATTEMPTS};

use crate::clock::Clock;
use crate::processor::{ProcessOutcome, Processor};
use crate::retry::RetryStrategy;
use crate::store::{ClaimOutcome, EventStore, EventStoreError};

const UNSPECIFIED_FAILURE: &str = "processor reported failure without a reason";

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Pause after an attempt or a lost claim
    pub poll_interval: Duration,
    /// Pause when nothing is claimable
    pub idle_interval: Duration,
    /// Pause after a store error
    pub error_backoff: Duration,
    /// Attempt budget of ingested events; only used to log the retry schedule
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_millis(100),
            idle_interval: Duration::from_millis(1000),
            error_backoff: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Empty,
    Contended,
    Delivered(EventId),
    Retried(EventId),
    DeadLettered(EventId),
}

impl Tick {
    fn pause(self, config: &WorkerConfig) -> Duration {
        match self {
            Tick::Empty => config.idle_interval,
            _ => config.poll_interval,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub contended: u64,
    pub store_errors: u64,
}

/// Polls the store and drives claimed events to their next state.
pub struct WorkerLoop<S, P> {
    store: S,
    processor: P,
    retry: Arc<RetryStrategy>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, P> WorkerLoop<S, P>
where
    S: EventStore,
    P: Processor,
{
    pub fn new(
        store: S,
        processor: P,
        retry: Arc<RetryStrategy>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            retry,
            clock,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Run until `token` is cancelled.
    ///
    /// Cancellation is observed between iterations and during pauses; an
    /// attempt that has started is always finalized.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            worker = %self.config.name,
            schedule = ?self.retry.describe_schedule(self.config.max_attempts),
            "worker started"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(tick) => tick.pause(&self.config),
                Err(e) => {
                    self.record(|s| s.store_errors += 1);
                    error!(worker = %self.config.name, error = %e, "store error, backing off");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {}
                () = token.cancelled() => break,
            }
        }

        info!(worker = %self.config.name, stats = ?self.stats(), "worker stopped");
    }

    /// One claim and, if something was claimed, its attempt and finalization.
    pub async fn run_once(&self) -> Result<Tick, EventStoreError> {
        let mut event = match self.store.claim_next().await? {
            ClaimOutcome::Claimed(event) => event,
            ClaimOutcome::Contended => {
                self.record(|s| s.contended += 1);
                debug!(worker = %self.config.name, "claim contended");
                return Ok(Tick::Contended);
            }
            ClaimOutcome::Empty => return Ok(Tick::Empty),
        };

        debug!(
            worker = %self.config.name,
            event_id = %event.id,
            source = %event.source,
            attempt = event.attempts + 1,
            "claimed event"
        );

        let tick = match self.attempt(&event).await {
            ProcessOutcome::Success => {
                self.store.mark_delivered(&mut event).await?;
                info!(event_id = %event.id, attempts = event.attempts, "event delivered");
                Tick::Delivered(event.id)
            }
            ProcessOutcome::Failure(reason) => self.fail(&mut event, reason).await?,
        };

        self.record(|s| {
            s.processed += 1;
            match tick {
                Tick::Delivered(_) => s.delivered += 1,
                Tick::Retried(_) => s.retried += 1,
                Tick::DeadLettered(_) => s.dead_lettered += 1,
                Tick::Empty | Tick::Contended => {}
            }
        });
        Ok(tick)
    }

    async fn attempt(&self, event: &Event) -> ProcessOutcome {
        match AssertUnwindSafe(self.processor.attempt(event))
            .catch_unwind()
            .await
        {
            Ok(ProcessOutcome::Failure(reason)) if reason.trim().is_empty() => {
                ProcessOutcome::failure(UNSPECIFIED_FAILURE)
            }
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event_id = %event.id, panic = %message, "processor panicked");
                ProcessOutcome::failure(format!("processor panicked: {message}"))
            }
        }
    }

    async fn fail(&self, event: &mut Event, reason: String) -> Result<Tick, EventStoreError> {
        let next = event.attempts + 1;
        if next < event.max_attempts {
            let next_retry_at = self.retry.next_retry_at(next);
            self.store
                .mark_for_retry(event, next_retry_at, &reason)
                .await?;
            warn!(
                event_id = %event.id,
                attempt = next,
                %next_retry_at,
                error = %reason,
                "attempt failed, retry scheduled"
            );
            Ok(Tick::Retried(event.id))
        } else {
            self.store.mark_dead_lettered(event, &reason).await?;
            error!(
                event_id = %event.id,
                attempts = event.attempts,
                error = %reason,
                "attempts exhausted, event dead-lettered"
            );
            Ok(Tick::DeadLettered(event.id))
        }
    }
}

impl<S, P> WorkerLoop<S, P>
where
    S: EventStore + 'static,
    P: Processor + 'static,
{
    /// Run on the tokio runtime under a child of `token`.
    pub fn spawn(self, token: &CancellationToken) -> WorkerHandle {
        let token = token.child_token();
        let stats = self.stats.clone();
        let run_token = token.clone();
        let join = tokio::spawn(async move { self.run(run_token).await });
        WorkerHandle { token, join, stats }
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait for the worker to stop on its own (parent token cancelled).
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task failed");
        }
    }

    /// Cancel this worker and wait for its in-flight attempt to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }
}
