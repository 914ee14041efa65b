//! Integration tests for the full delivery pipeline.
//!
//! Tests: Ingestion → EventStore → WorkerLoop → Processor → EventStore
//!
//! Verifies:
//! - Concurrent ingestion of one pair creates exactly one event
//! - Concurrent claimers never share an event
//! - Events reach `DeadLettered` exactly when attempts run out

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use tokio_util::sync::CancellationToken;

    use hookrelay_core::{Event, EventId, EventStatus};

    use crate::clock::{Clock, SystemClock, TestClock};
    use crate::ingest::{IngestOutcome, IngestionService};
    use crate::processor::{ProcessOutcome, Processor};
    use crate::retry::{RetryConfig, RetryStrategy};
    use crate::store::{ClaimOutcome, EventStore, InMemoryEventStore};
    use crate::worker::{Tick, WorkerConfig, WorkerLoop};

    /// Records every attempt per event and always succeeds.
    #[derive(Default)]
    struct Recording {
        attempts: Mutex<HashMap<EventId, u32>>,
    }

    #[async_trait]
    impl Processor for Recording {
        async fn attempt(&self, event: &Event) -> ProcessOutcome {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(event.id)
                .or_default() += 1;
            tokio::task::yield_now().await;
            ProcessOutcome::Success
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Processor for AlwaysFails {
        async fn attempt(&self, _event: &Event) -> ProcessOutcome {
            ProcessOutcome::failure("connection reset by peer")
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingestion_of_one_pair_creates_one_event() {
        let store = InMemoryEventStore::arc();
        let svc = Arc::new(IngestionService::new(store.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let svc = svc.clone();
                tokio::spawn(async move {
                    let body = format!(r#"{{"copy": {i}}}"#);
                    svc.ingest("shopify", "order-77", body.as_bytes()).await.unwrap()
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let accepted = results
            .iter()
            .filter(|(_, o)| *o == IngestOutcome::Accepted)
            .count();
        assert_eq!(accepted, 1);
        let first = results[0].0;
        assert!(results.iter().all(|(id, _)| *id == first));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_yield_exactly_one_winner() {
        for round in 0..20 {
            let store = InMemoryEventStore::arc();
            IngestionService::new(store.clone())
                .ingest("stripe", &format!("k-{round}"), b"{}")
                .await
                .unwrap();

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move { store.claim_next().await.unwrap() })
                })
                .collect();

            let mut claimed = 0;
            for task in tasks {
                match task.await.unwrap() {
                    ClaimOutcome::Claimed(event) => {
                        assert_eq!(event.status, EventStatus::Processing);
                        claimed += 1;
                    }
                    ClaimOutcome::Contended | ClaimOutcome::Empty => {}
                }
            }
            assert_eq!(claimed, 1, "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn competing_workers_deliver_each_event_once() {
        let store = InMemoryEventStore::arc();
        let svc = IngestionService::new(store.clone());
        for n in 0..40 {
            svc.ingest("github", &format!("delivery-{n}"), br#"{"action": "opened"}"#)
                .await
                .unwrap();
        }

        let processor = Arc::new(Recording::default());
        let token = CancellationToken::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let config = WorkerConfig {
                    poll_interval: Duration::from_millis(1),
                    idle_interval: Duration::from_millis(5),
                    ..WorkerConfig::default()
                }
                .with_name(format!("worker-{i}"));
                WorkerLoop::new(
                    store.clone(),
                    processor.clone(),
                    Arc::new(RetryStrategy::default()),
                    clock.clone(),
                    config,
                )
                .spawn(&token)
            })
            .collect();

        for _ in 0..1000 {
            if store.status_counts().await.unwrap().delivered == 40 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        token.cancel();
        let mut delivered = 0;
        for handle in handles {
            delivered += handle.stats().delivered;
            handle.join().await;
        }

        assert_eq!(store.status_counts().await.unwrap().delivered, 40);
        assert_eq!(delivered, 40);
        let attempts = processor.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 40);
        assert!(attempts.values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn duplicate_after_delivery_does_not_requeue() {
        let clock = Arc::new(TestClock::default());
        let store = Arc::new(InMemoryEventStore::with_clock(clock.clone()));
        let svc = IngestionService::with_clock(store.clone(), clock.clone());
        let (id, _) = svc.ingest("stripe", "evt_1", b"{}").await.unwrap();

        let worker = WorkerLoop::new(
            store.clone(),
            Recording::default(),
            Arc::new(RetryStrategy::seeded(RetryConfig::default(), 5, clock.clone())),
            clock.clone(),
            WorkerConfig::default(),
        );
        assert_eq!(worker.run_once().await.unwrap(), Tick::Delivered(id));

        let (again, outcome) = svc.ingest("stripe", "evt_1", b"{}").await.unwrap();
        assert_eq!((again, outcome), (id, IngestOutcome::Duplicate));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Empty);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn repeated_ingestion_always_resolves_to_first_event(
            payloads in prop::collection::vec(any::<u16>(), 1..12),
        ) {
            let rt = runtime();
            let (ids, len) = rt.block_on(async {
                let store = InMemoryEventStore::arc();
                let svc = IngestionService::new(store.clone());
                let mut ids = Vec::new();
                for (i, p) in payloads.iter().enumerate() {
                    let body = format!(r#"{{"n": {p}}}"#);
                    let (id, outcome) = svc.ingest("src", "same-key", body.as_bytes()).await.unwrap();
                    assert_eq!(outcome == IngestOutcome::Accepted, i == 0);
                    ids.push(id);
                }
                (ids, store.len())
            });
            prop_assert_eq!(len, 1);
            prop_assert!(ids.iter().all(|id| *id == ids[0]));
        }

        #[test]
        fn dead_letter_reached_exactly_at_max_attempts(max_attempts in 1u32..7) {
            let rt = runtime();
            let trace = rt.block_on(async {
                let clock = Arc::new(TestClock::default());
                let store = Arc::new(InMemoryEventStore::with_clock(clock.clone()));
                let (id, _) = IngestionService::with_clock(store.clone(), clock.clone())
                    .with_max_attempts(max_attempts)
                    .ingest("src", "k", b"{}")
                    .await
                    .unwrap();
                let retry = RetryStrategy::seeded(RetryConfig::default(), 9, clock.clone());
                let worker = WorkerLoop::new(
                    store.clone(),
                    AlwaysFails,
                    Arc::new(retry),
                    clock.clone(),
                    WorkerConfig::default(),
                );

                let mut trace = Vec::new();
                for _ in 0..(max_attempts + 3) {
                    let tick = worker.run_once().await.unwrap();
                    let event = store.find_by_id(id).await.unwrap().unwrap();
                    trace.push((tick, event.status, event.attempts));
                    clock.advance(Duration::from_secs(24 * 60 * 60));
                }
                trace
            });

            let last = max_attempts as usize - 1;
            for (i, (tick, status, attempts)) in trace.iter().enumerate() {
                prop_assert!(*attempts <= max_attempts);
                if i < last {
                    prop_assert!(matches!(tick, Tick::Retried(_)));
                    prop_assert_eq!(*status, EventStatus::Retrying);
                    prop_assert_eq!(*attempts, i as u32 + 1);
                } else if i == last {
                    prop_assert!(matches!(tick, Tick::DeadLettered(_)));
                    prop_assert_eq!(*status, EventStatus::DeadLettered);
                    prop_assert_eq!(*attempts, max_attempts);
                } else {
                    prop_assert_eq!(*tick, Tick::Empty);
                }
            }
        }
    }
}
