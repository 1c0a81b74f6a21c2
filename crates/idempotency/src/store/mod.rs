//! Pluggable record storage.
//!
//! The store is the only shared mutable resource in the layer. Records are
//! logically append-only per key (one create, many reads, one delete on
//! expiry), so the only operation that needs atomicity is [`claim`]: an
//! insert-if-absent that lets exactly one of two concurrent requests with the
//! same key win the right to execute.
//!
//! [`claim`]: IdempotencyStore::claim

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{error::StoreError, record::IdempotencyRecord};

/// Result of an atomic insert-if-absent.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The key was absent; the pending record is now in place.
    Claimed,
    /// Another record already holds the key. Lookup and insert are one
    /// atomic step, so a concurrent claimer loses cleanly instead of racing.
    Existing(IdempotencyRecord),
}

/// Diagnostic snapshot for monitoring; the size estimate is approximate,
/// not a hard resource bound.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_records: u64,
    /// Entries past `expires_at` that have not been swept yet.
    pub expired_records: u64,
    pub memory_usage_estimate: u64,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert `record` iff no record exists for its key.
    async fn claim(&self, record: IdempotencyRecord) -> Result<ClaimOutcome, StoreError>;

    /// Transition the record for `key` to completed with the response to
    /// replay, extending its expiry to `expires_at`.
    async fn complete(
        &self,
        key: &str,
        response_status: u16,
        response_body: String,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Unconditionally overwrite any record for the key.
    async fn put(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove entries with `expires_at` in the past; returns how many.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Drop all records. Test isolation, not production use.
    async fn clear(&self) -> Result<(), StoreError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError>;
}
