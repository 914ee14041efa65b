//! Event lifecycle status.
//!
//! ```text
//! Queued --(claim)--> Processing --(success)--> Delivered [terminal]
//! Retrying --(claim, when next_retry_at <= now)--> Processing
//! Processing --(failure, attempts remaining)--> Retrying
//! Processing --(failure, attempts exhausted)--> DeadLettered [terminal]
//! ```
//!
//! The predicates are free functions over the closed enum so callers never
//! need a mutable event to ask about a status.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Delivery status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Accepted, waiting for its first attempt
    Queued,
    /// Claimed by a worker
    Processing,
    /// Failed, waiting for `next_retry_at`
    Retrying,
    /// Delivered successfully
    Delivered,
    /// Exhausted `max_attempts`
    DeadLettered,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Queued,
        EventStatus::Processing,
        EventStatus::Retrying,
        EventStatus::Delivered,
        EventStatus::DeadLettered,
    ];

    /// Stable storage/wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Processing => "processing",
            EventStatus::Retrying => "retrying",
            EventStatus::Delivered => "delivered",
            EventStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::corrupt(format!("unknown event status '{s}'")))
    }
}

/// Whether a worker may claim an event in this status.
///
/// `Retrying` events are additionally gated on `next_retry_at`; that check
/// lives with the store's claim predicate.
pub fn is_claimable(status: EventStatus) -> bool {
    matches!(status, EventStatus::Queued | EventStatus::Retrying)
}

/// Terminal statuses have no outgoing transitions.
pub fn is_terminal(status: EventStatus) -> bool {
    matches!(status, EventStatus::Delivered | EventStatus::DeadLettered)
}

/// Human-readable description for observability responses.
pub fn description(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Queued => "Awaiting first processing attempt",
        EventStatus::Processing => "Currently being processed",
        EventStatus::Retrying => "Failed, scheduled for retry",
        EventStatus::Delivered => "Successfully processed",
        EventStatus::DeadLettered => "Permanently failed after max attempts",
    }
}
