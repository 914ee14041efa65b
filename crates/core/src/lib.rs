//! `hookrelay-core`: domain model for durable webhook events.
//!
//! This crate contains **pure domain** primitives (no storage, no runtime):
//! the event record, its lifecycle status, idempotency hashing and identifiers.

pub mod error;
pub mod event;
pub mod id;
pub mod idempotency;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use event::{Event, DEFAULT_MAX_ATTEMPTS};
pub use id::EventId;
pub use idempotency::{IdempotencyRecord, KeyHash};
pub use status::EventStatus;
