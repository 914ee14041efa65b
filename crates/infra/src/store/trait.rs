use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use hookrelay_core::{Event, EventId, EventStatus, IdempotencyRecord, KeyHash};

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The event is now `Processing` and owned by the caller.
    Claimed(Event),
    /// A candidate existed but another claimer transitioned it first.
    /// The queue is not necessarily empty; claim again.
    Contended,
    /// Nothing is claimable right now.
    Empty,
}

/// Event store operation error.
///
/// These are **infrastructure errors**. Input validation is a
/// `hookrelay_core::DomainError` and never reaches the store.
///
/// - **DuplicateKey**: the `(source, idempotency_key)` uniqueness constraint fired
/// - **NotFound**: a finalizing transition targeted a missing row
/// - **Unavailable**: the backend could not be reached (pool closed, I/O)
/// - **Corrupt**: a stored row could not be mapped back into an `Event`
/// - **Storage**: anything else the backend reported
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Event counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub retrying: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: u64) {
        match status {
            EventStatus::Queued => self.queued += n,
            EventStatus::Processing => self.processing += n,
            EventStatus::Retrying => self.retrying += n,
            EventStatus::Delivered => self.delivered += n,
            EventStatus::DeadLettered => self.dead_lettered += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.retrying + self.delivered + self.dead_lettered
    }
}

/// Durable storage for events and their idempotency index.
///
/// The store is the **only** owner of event state. Every guarantee the
/// pipeline makes rests on two primitives here:
///
/// - `insert_new` writes the event and its idempotency record in one
///   all-or-nothing transaction, and a uniqueness constraint on
///   `(source, idempotency_key)` rejects the second of two racing inserts
///   with `DuplicateKey`.
/// - `claim_next` is a two-phase optimistic claim: pick the oldest claimable
///   candidate, then transition it to `Processing` only if it is *still*
///   claimable. Zero rows affected means `Contended`. No in-process lock is
///   involved, so this holds across processes and machines.
///
/// The `mark_*` transitions are keyed by id alone. Only the worker holding
/// the claim calls them, so they are not re-validated against a predicate.
/// Each one updates the caller's copy of the event to the stored state.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically persist a new event together with its idempotency record.
    async fn insert_new(
        &self,
        event: &Event,
        record: &IdempotencyRecord,
    ) -> Result<(), EventStoreError>;

    /// Look up the event previously created for a key hash.
    async fn find_event_id_by_key_hash(
        &self,
        hash: &KeyHash,
    ) -> Result<Option<EventId>, EventStoreError>;

    async fn find_by_id(&self, id: EventId) -> Result<Option<Event>, EventStoreError>;

    /// Claim the oldest claimable event (queued, or retrying and due).
    async fn claim_next(&self) -> Result<ClaimOutcome, EventStoreError>;

    async fn mark_delivered(&self, event: &mut Event) -> Result<(), EventStoreError>;

    async fn mark_for_retry(
        &self,
        event: &mut Event,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventStoreError>;

    async fn mark_dead_lettered(&self, event: &mut Event, error: &str)
        -> Result<(), EventStoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn insert_new(
        &self,
        event: &Event,
        record: &IdempotencyRecord,
    ) -> Result<(), EventStoreError> {
        (**self).insert_new(event, record).await
    }

    async fn find_event_id_by_key_hash(
        &self,
        hash: &KeyHash,
    ) -> Result<Option<EventId>, EventStoreError> {
        (**self).find_event_id_by_key_hash(hash).await
    }

    async fn find_by_id(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        (**self).find_by_id(id).await
    }

    async fn claim_next(&self) -> Result<ClaimOutcome, EventStoreError> {
        (**self).claim_next().await
    }

    async fn mark_delivered(&self, event: &mut Event) -> Result<(), EventStoreError> {
        (**self).mark_delivered(event).await
    }

    async fn mark_for_retry(
        &self,
        event: &mut Event,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventStoreError> {
        (**self).mark_for_retry(event, next_retry_at, error).await
    }

    async fn mark_dead_lettered(
        &self,
        event: &mut Event,
        error: &str,
    ) -> Result<(), EventStoreError> {
        (**self).mark_dead_lettered(event, error).await
    }

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        (**self).status_counts().await
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        (**self).ping().await
    }
}
