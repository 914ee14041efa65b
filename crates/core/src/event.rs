//! The event record and its state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::EventId;
use crate::idempotency::KeyHash;
use crate::status::{is_claimable, EventStatus};

/// Attempts allowed before an event is dead-lettered, unless configured otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A webhook event and its delivery state.
///
/// Identity, origin and payload are fixed at creation. Everything else is
/// owned by the event store and only changes through the `apply_*`
/// transitions below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: String,
    pub idempotency_key: String,
    pub payload: JsonValue,
    pub status: EventStatus,
    /// Completed attempts (success or failure).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Reason of the most recent failed attempt. Overwritten, never cleared.
    pub last_error: Option<String>,
    /// Set only while `status == Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Create a new queued event.
    pub fn new(
        source: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: JsonValue,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let source = source.into();
        let idempotency_key = idempotency_key.into();
        validate_source(&source)?;
        validate_idempotency_key(&idempotency_key)?;
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }

        Ok(Self {
            id: EventId::new(),
            source,
            idempotency_key,
            payload,
            status: EventStatus::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn key_hash(&self) -> KeyHash {
        KeyHash::compute(&self.source, &self.idempotency_key)
    }

    /// Whether the store may hand this event to a worker at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        is_claimable(self.status)
            && (self.status != EventStatus::Retrying
                || self.next_retry_at.is_some_and(|at| at <= now))
    }

    /// Claimed by a worker.
    pub fn apply_claim(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Processing;
        self.next_retry_at = None;
        self.touch(now);
    }

    /// Attempt succeeded.
    pub fn apply_delivered(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Delivered;
        self.attempts += 1;
        self.next_retry_at = None;
        self.touch(now);
    }

    /// Attempt failed with attempts remaining.
    pub fn apply_retry(&mut self, next_retry_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = EventStatus::Retrying;
        self.attempts += 1;
        self.last_error = Some(error);
        self.next_retry_at = Some(next_retry_at);
        self.touch(now);
    }

    /// Attempt failed and no attempts remain.
    pub fn apply_dead_lettered(&mut self, error: String, now: DateTime<Utc>) {
        self.status = EventStatus::DeadLettered;
        self.attempts += 1;
        self.last_error = Some(error);
        self.next_retry_at = None;
        self.touch(now);
    }

    // updated_at never moves backwards, even if clocks disagree between workers.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}

pub fn validate_source(source: &str) -> DomainResult<()> {
    if source.trim().is_empty() {
        return Err(DomainError::validation("source is required"));
    }
    Ok(())
}

pub fn validate_idempotency_key(key: &str) -> DomainResult<()> {
    if key.trim().is_empty() {
        return Err(DomainError::validation("Idempotency-Key header is required"));
    }
    Ok(())
}

/// Parse a raw request body into a structured payload.
///
/// Only JSON objects and arrays are accepted; bare scalars are not documents.
pub fn parse_payload(raw: &[u8]) -> DomainResult<JsonValue> {
    let value: JsonValue = serde_json::from_slice(raw)
        .map_err(|e| DomainError::validation(format!("invalid JSON payload: {e}")))?;
    match value {
        JsonValue::Object(_) | JsonValue::Array(_) => Ok(value),
        _ => Err(DomainError::validation(
            "invalid JSON payload: expected an object or array",
        )),
    }
}
