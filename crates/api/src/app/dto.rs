use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use hookrelay_core::status;
use hookrelay_core::{Event, EventId, EventStatus};
use hookrelay_infra::{IngestOutcome, StatusCounts};

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: EventId,
    pub status: IngestOutcome,
}

/// Operator view of one event.
#[derive(Debug, Serialize)]
pub struct EventDetail {
    pub id: EventId,
    pub source: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub status_description: &'static str,
}

impl From<Event> for EventDetail {
    fn from(event: Event) -> Self {
        Self {
            status_description: status::description(event.status),
            id: event.id,
            source: event.source,
            status: event.status,
            attempts: event.attempts,
            max_attempts: event.max_attempts,
            last_error: event.last_error,
            next_retry_at: event.next_retry_at,
            created_at: event.created_at,
            updated_at: event.updated_at,
            payload: event.payload,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReadyChecks {
    pub database: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub checks: ReadyChecks,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: u64,
    pub events: StatusCounts,
    pub timestamp: DateTime<Utc>,
}
