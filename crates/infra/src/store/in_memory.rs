//! In-memory event store for tests and single-process development.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hookrelay_core::{Event, EventId, IdempotencyRecord, KeyHash};

use super::r#trait::{ClaimOutcome, EventStore, EventStoreError, StatusCounts};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<EventId, Event>,
    idempotency: HashMap<KeyHash, IdempotencyRecord>,
    // UNIQUE (source, idempotency_key)
    source_keys: HashSet<(String, String)>,
}

/// Event store backed by process memory.
///
/// Mirrors the Postgres store's semantics: the dual insert is all-or-nothing
/// under one write lock, and claiming is two-phase, so a claimer that loses
/// the race between selecting and transitioning sees `Contended`.
#[derive(Debug)]
pub struct InMemoryEventStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|t| t.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, EventStoreError> {
        self.tables
            .read()
            .map_err(|_| EventStoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, EventStoreError> {
        self.tables
            .write()
            .map_err(|_| EventStoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn oldest_claimable(&self, now: DateTime<Utc>) -> Result<Option<EventId>, EventStoreError> {
        let tables = self.read()?;
        Ok(tables
            .events
            .values()
            .filter(|e| e.is_claimable_at(now))
            .min_by_key(|e| (e.created_at, e.id))
            .map(|e| e.id))
    }

    fn transition(
        &self,
        event: &mut Event,
        apply: impl FnOnce(&mut Event, DateTime<Utc>),
    ) -> Result<(), EventStoreError> {
        let now = self.clock.now();
        let mut tables = self.write()?;
        let stored = tables
            .events
            .get_mut(&event.id)
            .ok_or(EventStoreError::NotFound(event.id))?;
        apply(stored, now);
        *event = stored.clone();
        Ok(())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert_new(
        &self,
        event: &Event,
        record: &IdempotencyRecord,
    ) -> Result<(), EventStoreError> {
        let mut tables = self.write()?;
        let pair = (event.source.clone(), event.idempotency_key.clone());
        if tables.source_keys.contains(&pair) || tables.idempotency.contains_key(&record.key_hash) {
            return Err(EventStoreError::DuplicateKey(record.key_hash.to_string()));
        }
        if tables.events.contains_key(&event.id) {
            return Err(EventStoreError::Storage(format!(
                "event id already exists: {}",
                event.id
            )));
        }

        tables.source_keys.insert(pair);
        tables
            .idempotency
            .insert(record.key_hash.clone(), record.clone());
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn find_event_id_by_key_hash(
        &self,
        hash: &KeyHash,
    ) -> Result<Option<EventId>, EventStoreError> {
        Ok(self.read()?.idempotency.get(hash).map(|r| r.event_id))
    }

    async fn find_by_id(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    async fn claim_next(&self) -> Result<ClaimOutcome, EventStoreError> {
        let now = self.clock.now();
        let Some(candidate) = self.oldest_claimable(now)? else {
            return Ok(ClaimOutcome::Empty);
        };

        // Other claimers may run between selecting and transitioning.
        tokio::task::yield_now().await;

        let mut tables = self.write()?;
        match tables.events.get_mut(&candidate) {
            Some(event) if event.is_claimable_at(now) => {
                event.apply_claim(now);
                Ok(ClaimOutcome::Claimed(event.clone()))
            }
            _ => Ok(ClaimOutcome::Contended),
        }
    }

    async fn mark_delivered(&self, event: &mut Event) -> Result<(), EventStoreError> {
        self.transition(event, |e, now| e.apply_delivered(now))
    }

    async fn mark_for_retry(
        &self,
        event: &mut Event,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventStoreError> {
        self.transition(event, |e, now| {
            e.apply_retry(next_retry_at, error.to_string(), now)
        })
    }

    async fn mark_dead_lettered(
        &self,
        event: &mut Event,
        error: &str,
    ) -> Result<(), EventStoreError> {
        self.transition(event, |e, now| e.apply_dead_lettered(error.to_string(), now))
    }

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        let tables = self.read()?;
        let mut counts = StatusCounts::default();
        for event in tables.events.values() {
            counts.add(event.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        self.read().map(|_| ())
    }
}
