//! Idempotency keys: stable hashing of `(source, key)` pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::EventId;

/// Lowercase-hex SHA-256 of the length-prefixed `(source, idempotency_key)` pair.
///
/// The source length goes in as a big-endian `u64` ahead of both strings, so
/// no two distinct pairs share an input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyHash(String);

impl KeyHash {
    pub fn compute(source: &str, idempotency_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((source.len() as u64).to_be_bytes());
        hasher.update(source.as_bytes());
        hasher.update(idempotency_key.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for KeyHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index entry mapping a key hash to the event it produced.
///
/// Written once, in the same transaction as its event; never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key_hash: KeyHash,
    pub event_id: EventId,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key_hash: KeyHash, event_id: EventId, created_at: DateTime<Utc>) -> Self {
        Self {
            key_hash,
            event_id,
            created_at,
        }
    }
}
