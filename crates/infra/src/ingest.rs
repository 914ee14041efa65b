//! Webhook ingestion: validate, deduplicate, persist.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use hookrelay_core::event::{parse_payload, validate_idempotency_key, validate_source};
use hookrelay_core::{DomainError, Event, EventId, IdempotencyRecord, KeyHash, DEFAULT_MAX_ATTEMPTS};

use crate::clock::{Clock, SystemClock};
use crate::store::{EventStore, EventStoreError};

/// Whether an ingestion created a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Accepts webhook deliveries and turns them into queued events.
///
/// Validation runs before any store access. A repeated `(source, key)` pair
/// resolves to the event created the first time, whatever its payload.
pub struct IngestionService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl<S: EventStore> IngestionService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempt budget for newly created events. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(skip(self, raw_payload), fields(payload_bytes = raw_payload.len()), err)]
    pub async fn ingest(
        &self,
        source: &str,
        idempotency_key: &str,
        raw_payload: &[u8],
    ) -> Result<(EventId, IngestOutcome), IngestError> {
        validate_source(source)?;
        validate_idempotency_key(idempotency_key)?;
        let payload = parse_payload(raw_payload)?;

        let hash = KeyHash::compute(source, idempotency_key);
        if let Some(existing) = self.store.find_event_id_by_key_hash(&hash).await? {
            debug!(event_id = %existing, "duplicate delivery");
            return Ok((existing, IngestOutcome::Duplicate));
        }

        let now = self.clock.now();
        let event = Event::new(source, idempotency_key, payload, self.max_attempts, now)?;
        let record = IdempotencyRecord::new(hash.clone(), event.id, now);

        match self.store.insert_new(&event, &record).await {
            Ok(()) => {
                info!(event_id = %event.id, "event accepted");
                Ok((event.id, IngestOutcome::Accepted))
            }
            Err(EventStoreError::DuplicateKey(_)) => {
                // A concurrent ingestion of the same pair won the insert.
                let existing = self
                    .store
                    .find_event_id_by_key_hash(&hash)
                    .await?
                    .ok_or_else(|| {
                        EventStoreError::Storage(format!(
                            "idempotency record for {hash} missing after duplicate insert"
                        ))
                    })?;
                debug!(event_id = %existing, "duplicate delivery lost insert race");
                Ok((existing, IngestOutcome::Duplicate))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use hookrelay_core::EventStatus;

    fn service() -> IngestionService<Arc<InMemoryEventStore>> {
        IngestionService::new(InMemoryEventStore::arc())
    }

    #[tokio::test]
    async fn first_delivery_is_accepted_and_queued() {
        let svc = service();
        let (id, outcome) = svc.ingest("stripe", "evt-1", br#"{"amount": 10}"#).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);

        let event = svc.store().find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Queued);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(event.payload["amount"], 10);
    }

    #[tokio::test]
    async fn repeat_returns_original_id_even_with_new_payload() {
        let svc = service();
        let (first, _) = svc.ingest("stripe", "evt-1", br#"{"v": 1}"#).await.unwrap();
        let (second, outcome) = svc.ingest("stripe", "evt-1", br#"{"v": 2}"#).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Duplicate);
        assert_eq!(first, second);

        let stored = svc.store().find_by_id(first).await.unwrap().unwrap();
        assert_eq!(stored.payload["v"], 1);
        assert_eq!(svc.store().len(), 1);
    }

    #[tokio::test]
    async fn same_key_from_different_sources_is_distinct() {
        let svc = service();
        let (a, _) = svc.ingest("stripe", "k", b"{}").await.unwrap();
        let (b, outcome) = svc.ingest("github", "k", b"{}").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn colon_in_source_or_key_does_not_merge_pairs() {
        let svc = service();
        let (first, outcome) = svc.ingest("github:push", "123", b"{}").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);
        let (second, outcome) = svc.ingest("github", "push:123", b"{}").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);
        assert_ne!(first, second);

        let stored = svc.store().find_by_id(second).await.unwrap().unwrap();
        assert_eq!(stored.source, "github");
        assert_eq!(stored.idempotency_key, "push:123");
        assert_eq!(svc.store().len(), 2);
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let svc = service();
        for (source, key, body) in [
            ("", "k", &b"{}"[..]),
            ("stripe", "", &b"{}"[..]),
            ("stripe", "k", &b"not json"[..]),
            ("stripe", "k", &b"\"scalar\""[..]),
        ] {
            let err = svc.ingest(source, key, body).await.unwrap_err();
            assert!(matches!(err, IngestError::Validation(_)), "{err:?}");
        }
        assert!(svc.store().is_empty());
    }

    #[tokio::test]
    async fn configured_attempt_budget_is_applied() {
        let svc = service().with_max_attempts(3);
        let (id, _) = svc.ingest("s", "k", b"[]").await.unwrap();
        let event = svc.store().find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.max_attempts, 3);
    }
}
