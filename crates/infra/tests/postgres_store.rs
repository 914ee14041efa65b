//! Postgres store tests.
//!
//! Skipped unless `HOOKRELAY_TEST_DATABASE_URL` points at a disposable
//! database. Each test works under its own random source name so runs do not
//! interfere with each other.

use std::sync::Arc;

use hookrelay_core::{EventId, EventStatus};
use hookrelay_infra::{
    ClaimOutcome, EventStore, EventStoreError, IngestOutcome, IngestionService,
    PostgresEventStore,
};

async fn store() -> Option<Arc<PostgresEventStore>> {
    let url = match std::env::var("HOOKRELAY_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("HOOKRELAY_TEST_DATABASE_URL not set; skipping");
            return None;
        }
    };
    let store = PostgresEventStore::connect(&url, 8).await.unwrap();
    store.ensure_schema().await.unwrap();
    Some(Arc::new(store))
}

fn unique_source() -> String {
    format!("test-{}", EventId::new().as_uuid().simple())
}

/// Claim until our own event comes back; other tests may share the table.
async fn claim_own(store: &PostgresEventStore, id: EventId) -> hookrelay_core::Event {
    for _ in 0..1000 {
        match store.claim_next().await.unwrap() {
            ClaimOutcome::Claimed(event) if event.id == id => return event,
            ClaimOutcome::Claimed(mut other) => {
                store.mark_delivered(&mut other).await.unwrap();
            }
            ClaimOutcome::Contended => {}
            ClaimOutcome::Empty => panic!("event {id} was not claimable"),
        }
    }
    panic!("event {id} never claimed");
}

#[tokio::test]
async fn ingest_persists_and_deduplicates() {
    let Some(store) = store().await else { return };
    let svc = IngestionService::new(store.clone());
    let source = unique_source();

    let (id, outcome) = svc.ingest(&source, "k1", br#"{"a": [1, 2]}"#).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Accepted);
    let (again, outcome) = svc.ingest(&source, "k1", br#"{"b": 0}"#).await.unwrap();
    assert_eq!((again, outcome), (id, IngestOutcome::Duplicate));

    let event = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(event.source, source);
    assert_eq!(event.payload, serde_json::json!({"a": [1, 2]}));
    assert_eq!(
        store.find_event_id_by_key_hash(&event.key_hash()).await.unwrap(),
        Some(id)
    );
}

#[tokio::test]
async fn racing_ingestions_agree_on_one_event() {
    let Some(store) = store().await else { return };
    let svc = Arc::new(IngestionService::new(store.clone()));
    let source = unique_source();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let svc = svc.clone();
            let source = source.clone();
            tokio::spawn(async move { svc.ingest(&source, "dup", b"{}").await.unwrap() })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(
        results
            .iter()
            .filter(|(_, o)| *o == IngestOutcome::Accepted)
            .count(),
        1
    );
    assert!(results.iter().all(|(id, _)| *id == results[0].0));
}

#[tokio::test]
async fn claim_and_finalize_round_trip() {
    let Some(store) = store().await else { return };
    let svc = IngestionService::new(store.clone()).with_max_attempts(2);
    let (id, _) = svc.ingest(&unique_source(), "k", b"[]").await.unwrap();

    let mut event = claim_own(&store, id).await;
    assert_eq!(event.status, EventStatus::Processing);

    let at = chrono::Utc::now() - chrono::Duration::seconds(1);
    store.mark_for_retry(&mut event, at, "timeout").await.unwrap();
    assert_eq!(event.status, EventStatus::Retrying);
    assert_eq!(event.attempts, 1);

    let mut event = claim_own(&store, id).await;
    assert!(event.next_retry_at.is_none());
    store.mark_dead_lettered(&mut event, "timeout again").await.unwrap();

    let stored = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::DeadLettered);
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("timeout again"));
}

#[tokio::test]
async fn finalizing_a_missing_event_is_not_found() {
    let Some(store) = store().await else { return };
    let mut ghost = hookrelay_core::Event::new(
        unique_source(),
        "k",
        serde_json::json!({}),
        3,
        chrono::Utc::now(),
    )
    .unwrap();
    let err = store.mark_delivered(&mut ghost).await.unwrap_err();
    assert!(matches!(err, EventStoreError::NotFound(_)));
}

#[tokio::test]
async fn ping_and_counts() {
    let Some(store) = store().await else { return };
    store.ping().await.unwrap();
    let counts = store.status_counts().await.unwrap();
    assert!(counts.total() >= counts.queued);
}
