//! Delivery processors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use hookrelay_core::Event;

use crate::clock::{Clock, SystemClock};

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    /// Human-readable reason, recorded as the event's `last_error`.
    Failure(String),
}

impl ProcessOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        ProcessOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Success)
    }
}

/// Performs one delivery attempt for a claimed event.
///
/// Implementations report failure through [`ProcessOutcome::Failure`]. A panic
/// is caught by the worker and treated as a failure.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn attempt(&self, event: &Event) -> ProcessOutcome;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn attempt(&self, event: &Event) -> ProcessOutcome {
        (**self).attempt(event).await
    }
}

/// Demo processor driven by flags in the event payload.
///
/// - `simulate_delay_ms: n` sleeps `n` ms before deciding
/// - `simulate_failure: true` always fails
/// - `simulate_transient: true` fails until the event has two recorded attempts
///
/// Anything else takes 50 ms and succeeds.
#[derive(Debug)]
pub struct SimulatedProcessor {
    clock: Arc<dyn Clock>,
}

impl SimulatedProcessor {
    pub const DEFAULT_WORK: Duration = Duration::from_millis(50);

    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn decide(event: &Event) -> ProcessOutcome {
        let flag = |name: &str| event.payload.get(name).and_then(|v| v.as_bool()) == Some(true);
        if flag("simulate_failure") {
            return ProcessOutcome::failure("Simulated permanent failure");
        }
        if flag("simulate_transient") && event.attempts < 2 {
            return ProcessOutcome::failure("Simulated transient failure");
        }
        ProcessOutcome::Success
    }
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for SimulatedProcessor {
    async fn attempt(&self, event: &Event) -> ProcessOutcome {
        let started = Instant::now();
        let attempt = event.attempts + 1;

        let work = event
            .payload
            .get("simulate_delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_WORK);
        self.clock.sleep(work).await;

        let outcome = Self::decide(event);
        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            ProcessOutcome::Success => info!(
                event_id = %event.id,
                source = %event.source,
                attempt,
                duration_ms,
                "processing succeeded"
            ),
            ProcessOutcome::Failure(reason) => warn!(
                event_id = %event.id,
                source = %event.source,
                attempt,
                duration_ms,
                error = %reason,
                "processing failed"
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use chrono::Utc;
    use serde_json::json;

    fn event(payload: serde_json::Value) -> Event {
        Event::new("demo", "k", payload, 5, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn plain_payload_succeeds_after_default_work() {
        let clock = Arc::new(TestClock::default());
        let processor = SimulatedProcessor::with_clock(clock.clone());
        let outcome = processor.attempt(&event(json!({"order": 1}))).await;
        assert_eq!(outcome, ProcessOutcome::Success);
        assert_eq!(clock.sleeps(), vec![SimulatedProcessor::DEFAULT_WORK]);
    }

    #[tokio::test]
    async fn permanent_failure_always_fails() {
        let processor = SimulatedProcessor::with_clock(Arc::new(TestClock::default()));
        let mut e = event(json!({"simulate_failure": true}));
        for attempts in 0..4 {
            e.attempts = attempts;
            assert_eq!(
                processor.attempt(&e).await,
                ProcessOutcome::failure("Simulated permanent failure")
            );
        }
    }

    #[tokio::test]
    async fn transient_failure_clears_on_third_attempt() {
        let processor = SimulatedProcessor::with_clock(Arc::new(TestClock::default()));
        let mut e = event(json!({"simulate_transient": true}));
        let mut outcomes = Vec::new();
        for attempts in 0..3 {
            e.attempts = attempts;
            outcomes.push(processor.attempt(&e).await.is_success());
        }
        assert_eq!(outcomes, vec![false, false, true]);
    }

    #[tokio::test]
    async fn honours_requested_delay() {
        let clock = Arc::new(TestClock::default());
        let processor = SimulatedProcessor::with_clock(clock.clone());
        processor.attempt(&event(json!({"simulate_delay_ms": 1500}))).await;
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1500)]);
    }
}
