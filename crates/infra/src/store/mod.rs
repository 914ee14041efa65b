//! Event store boundary.
//!
//! The store owns all event state and provides the two atomic primitives the
//! pipeline depends on: the deduplicating dual insert and the optimistic claim.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{ClaimOutcome, EventStore, EventStoreError, StatusCounts};
