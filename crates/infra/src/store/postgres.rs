//! Postgres-backed event store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateKey` | Two inserts raced on the same `(source, idempotency_key)` |
//! | Database (other) | Any other | `Storage` | Constraint or query failures |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` | Database unreachable |
//! | ColumnDecode / Decode | N/A | `Corrupt` | Stored row does not map back to an event |
//! | Other | N/A | `Storage` | Anything else |
//!
//! ## Claiming
//!
//! `claim_next` selects the oldest claimable id, then issues a conditional
//! `UPDATE ... WHERE id = $1 AND <still claimable> RETURNING *`. Under READ
//! COMMITTED a concurrent claimer blocks on the row lock, re-evaluates the
//! predicate against the committed row and updates nothing. Zero rows is
//! reported as `Contended`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use hookrelay_core::{Event, EventId, EventStatus, IdempotencyRecord, KeyHash};

use super::r#trait::{ClaimOutcome, EventStore, EventStoreError, StatusCounts};
use crate::clock::{Clock, SystemClock};

const EVENT_COLUMNS: &str = "id, source, idempotency_key, payload, status, attempts, \
     max_attempts, last_error, next_retry_at, created_at, updated_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id              UUID PRIMARY KEY,
        source          TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        payload         JSONB NOT NULL,
        status          TEXT NOT NULL CHECK (status IN
                            ('queued', 'processing', 'retrying', 'delivered', 'dead_lettered')),
        attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts    INTEGER NOT NULL CHECK (max_attempts >= 1),
        last_error      TEXT,
        next_retry_at   TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        UNIQUE (source, idempotency_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS events_status_next_retry_at_idx
        ON events (status, next_retry_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS events_created_at_idx
        ON events (created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key_hash   TEXT PRIMARY KEY,
        event_id   UUID NOT NULL REFERENCES events (id),
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Postgres-backed event store.
///
/// `Send + Sync` and cheap to clone; all access goes through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("schema ready");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Replace the caller's copy with the row a finalizing UPDATE returned.
    fn finish(event: &mut Event, row: Option<PgRow>) -> Result<(), EventStoreError> {
        let row = row.ok_or(EventStoreError::NotFound(event.id))?;
        *event = event_from_row(&row)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event, record), fields(event_id = %event.id, source = %event.source), err)]
    async fn insert_new(
        &self,
        event: &Event,
        record: &IdempotencyRecord,
    ) -> Result<(), EventStoreError> {
        let attempts = to_i32("attempts", event.attempts)?;
        let max_attempts = to_i32("max_attempts", event.max_attempts)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (
                id, source, idempotency_key, payload, status, attempts,
                max_attempts, last_error, next_retry_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.source)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(attempts)
        .bind(max_attempts)
        .bind(event.last_error.as_deref())
        .bind(event.next_retry_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut *tx)
        .await;

        let inserted = match inserted {
            Ok(_) => {
                sqlx::query(
                    r#"
                    INSERT INTO idempotency_keys (key_hash, event_id, created_at)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(record.key_hash.as_str())
                .bind(record.event_id.as_uuid())
                .bind(record.created_at)
                .execute(&mut *tx)
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = inserted {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(if is_unique_violation(&e) {
                EventStoreError::DuplicateKey(record.key_hash.to_string())
            } else {
                map_sqlx_error("insert_new", e)
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), err)]
    async fn find_event_id_by_key_hash(
        &self,
        hash: &KeyHash,
    ) -> Result<Option<EventId>, EventStoreError> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT event_id FROM idempotency_keys WHERE key_hash = $1")
                .bind(hash.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_event_id_by_key_hash", e))?;
        Ok(id.map(EventId::from_uuid))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn find_by_id(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;
        row.as_ref().map(event_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<ClaimOutcome, EventStoreError> {
        let now = self.clock.now();

        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM events
            WHERE status = 'queued'
               OR (status = 'retrying' AND next_retry_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_select", e))?;

        let Some(candidate) = candidate else {
            return Ok(ClaimOutcome::Empty);
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE events
            SET status = 'processing',
                next_retry_at = NULL,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
              AND (status = 'queued'
                   OR (status = 'retrying' AND next_retry_at <= $2))
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(candidate)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_update", e))?;

        match row {
            Some(row) => Ok(ClaimOutcome::Claimed(event_from_row(&row)?)),
            None => {
                debug!(event_id = %EventId::from_uuid(candidate), "claim lost to another worker");
                Ok(ClaimOutcome::Contended)
            }
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn mark_delivered(&self, event: &mut Event) -> Result<(), EventStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE events
            SET status = 'delivered',
                attempts = attempts + 1,
                next_retry_at = NULL,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id.as_uuid())
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;
        Self::finish(event, row)
    }

    #[instrument(skip(self, event, error), fields(event_id = %event.id, %next_retry_at), err)]
    async fn mark_for_retry(
        &self,
        event: &mut Event,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE events
            SET status = 'retrying',
                attempts = attempts + 1,
                last_error = $3,
                next_retry_at = $4,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id.as_uuid())
        .bind(self.clock.now())
        .bind(error)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_for_retry", e))?;
        Self::finish(event, row)
    }

    #[instrument(skip(self, event, error), fields(event_id = %event.id), err)]
    async fn mark_dead_lettered(
        &self,
        event: &mut Event,
        error: &str,
    ) -> Result<(), EventStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE events
            SET status = 'dead_lettered',
                attempts = attempts + 1,
                last_error = $3,
                next_retry_at = NULL,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id.as_uuid())
        .bind(self.clock.now())
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dead_lettered", e))?;
        Self::finish(event, row)
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM events GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            let status: EventStatus = status
                .parse()
                .map_err(|e| EventStoreError::Corrupt(format!("{e}")))?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("ping", e))
    }
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    source: String,
    idempotency_key: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            idempotency_key: row.try_get("idempotency_key")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| {
            EventStoreError::Corrupt(format!("event {}: invalid {field}", row.id))
        };
        let status = row
            .status
            .parse::<EventStatus>()
            .map_err(|_| corrupt("status"))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| corrupt("attempts"))?;
        let max_attempts = u32::try_from(row.max_attempts).map_err(|_| corrupt("max_attempts"))?;

        Ok(Event {
            id: EventId::from_uuid(row.id),
            source: row.source,
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            status,
            attempts,
            max_attempts,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, EventStoreError> {
    let row = EventRow::from_row(row)
        .map_err(|e| EventStoreError::Corrupt(format!("failed to read event row: {e}")))?;
    Event::try_from(row)
}

fn to_i32(field: &str, value: u32) -> Result<i32, EventStoreError> {
    i32::try_from(value)
        .map_err(|_| EventStoreError::Storage(format!("{field} out of range: {value}")))
}

/// Map SQLx errors to `EventStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::DuplicateKey(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            EventStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => EventStoreError::Unavailable(format!("i/o error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
