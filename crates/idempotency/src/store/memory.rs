//! In-process store: the default for single-instance deployments and tests.
//!
//! A single mutex over the map makes `claim` atomic. Deduplication only
//! covers requests landing on this process; multi-instance deployments need
//! the database-backed store.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ClaimOutcome, IdempotencyStore, StoreStats};
use crate::{error::StoreError, record::{IdempotencyRecord, RecordState}};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the map itself is still consistent (single-step mutations).
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn claim(&self, record: IdempotencyRecord) -> Result<ClaimOutcome, StoreError> {
        let mut records = self.lock();
        match records.entry(record.key.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                Ok(ClaimOutcome::Existing(entry.get().clone()))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn complete(
        &self,
        key: &str,
        response_status: u16,
        response_body: String,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.lock();
        let record = records.get_mut(key).ok_or(StoreError::RecordNotFound)?;
        record.state = RecordState::Completed;
        record.response_status = Some(response_status);
        record.response_body = Some(response_body);
        record.expires_at = expires_at;
        Ok(())
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        self.lock().insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.lock().clear();
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let records = self.lock();
        let expired = records.values().filter(|r| r.is_expired(now)).count() as u64;
        let mut estimate = 0u64;
        for record in records.values() {
            if let Ok(serialized) = serde_json::to_string(record) {
                estimate += serialized.len() as u64;
            }
        }
        Ok(StoreStats {
            total_records: records.len() as u64,
            expired_records: expired,
            memory_usage_estimate: estimate,
        })
    }
}
