//! The single authority for idempotency-key lifecycle: hashing, claim,
//! conflict detection, replay lookup, and record persistence.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    config::IdempotencyConfig,
    error::IdempotencyError,
    hash,
    keys::validate_key,
    record::{IdempotencyRecord, RecordState, RequestContext},
    store::{ClaimOutcome, IdempotencyStore, StoreStats},
};

/// Result of a non-claiming lookup ([`IdempotencyService::check`]).
#[derive(Debug)]
pub struct CheckResult {
    pub is_duplicate: bool,
    pub record: Option<IdempotencyRecord>,
}

/// Result of an atomic claim ([`IdempotencyService::begin`]).
#[derive(Debug)]
pub enum BeginOutcome {
    /// The key is now claimed as pending. Execute the operation, then call
    /// `complete` on success or `abandon` on failure.
    Fresh,
    /// A completed record with the same hash and owner exists. Return its
    /// stored response verbatim; do not execute the operation.
    Replay { record: IdempotencyRecord },
}

/// Constructed once at process start with its configuration and store; the
/// store decides whether deduplication spans one process (in-memory) or a
/// whole deployment (database).
pub struct IdempotencyService {
    config: IdempotencyConfig,
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyService {
    pub fn new(config: IdempotencyConfig, store: Arc<dyn IdempotencyStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Deterministic digest over the normalized request. See [`crate::hash`].
    pub fn request_hash(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        headers: Option<&[(String, String)]>,
    ) -> Result<String, IdempotencyError> {
        hash::request_hash(method, url, body, headers, &self.config).map_err(Into::into)
    }

    /// Non-claiming lookup: classifies the state of `key` for the current
    /// request without reserving it. Sweeps expired records first so an
    /// expired entry is never reported as a hit.
    pub async fn check(
        &self,
        key: &str,
        request_hash: &str,
        context: &RequestContext,
    ) -> Result<CheckResult, IdempotencyError> {
        let now = Utc::now();
        self.store.sweep_expired(now).await?;

        let Some(record) = self.store.get(key).await? else {
            return Ok(CheckResult {
                is_duplicate: false,
                record: None,
            });
        };

        if record.request_hash != request_hash {
            return Err(IdempotencyError::Conflict {
                key: key.to_string(),
            });
        }
        if record.is_expired(now) {
            self.store.delete(key).await?;
            return Ok(CheckResult {
                is_duplicate: false,
                record: None,
            });
        }
        if context.conflicts_with(&record.context()) {
            return Err(IdempotencyError::Conflict {
                key: key.to_string(),
            });
        }
        match record.state {
            RecordState::Pending => Err(IdempotencyError::InProgress {
                key: key.to_string(),
            }),
            RecordState::Completed => Ok(CheckResult {
                is_duplicate: true,
                record: Some(record),
            }),
        }
    }

    /// Atomically claim `key` for the current request, or classify the
    /// record already holding it. The claim closes the check-then-store race:
    /// of two concurrent requests with the same key, exactly one observes
    /// `Fresh`; the other gets `InProgress` (or `Replay` once completed).
    pub async fn begin(
        &self,
        key: &str,
        request_hash: &str,
        context: &RequestContext,
    ) -> Result<BeginOutcome, IdempotencyError> {
        if !validate_key(key) {
            return Err(IdempotencyError::InvalidKey);
        }
        let now = Utc::now();
        self.store.sweep_expired(now).await?;

        match self.store.claim(self.pending_record(key, request_hash, context, now)).await? {
            ClaimOutcome::Claimed => Ok(BeginOutcome::Fresh),
            ClaimOutcome::Existing(record) if record.is_expired(now) => {
                // Sweep raced with another writer or the store skipped this
                // entry; drop it and try once more.
                self.store.delete(key).await?;
                match self
                    .store
                    .claim(self.pending_record(key, request_hash, context, now))
                    .await?
                {
                    ClaimOutcome::Claimed => Ok(BeginOutcome::Fresh),
                    ClaimOutcome::Existing(record) => {
                        self.classify_existing(key, request_hash, context, record)
                    }
                }
            }
            ClaimOutcome::Existing(record) => {
                self.classify_existing(key, request_hash, context, record)
            }
        }
    }

    fn classify_existing(
        &self,
        key: &str,
        request_hash: &str,
        context: &RequestContext,
        record: IdempotencyRecord,
    ) -> Result<BeginOutcome, IdempotencyError> {
        if record.request_hash != request_hash
            || context.conflicts_with(&record.context())
        {
            return Err(IdempotencyError::Conflict {
                key: key.to_string(),
            });
        }
        match record.state {
            RecordState::Pending => Err(IdempotencyError::InProgress {
                key: key.to_string(),
            }),
            RecordState::Completed => Ok(BeginOutcome::Replay { record }),
        }
    }

    /// Record the response of a successfully completed operation. Only 2xx
    /// outcomes belong here; failures must go through [`abandon`] so the key
    /// stays retryable.
    ///
    /// [`abandon`]: IdempotencyService::abandon
    pub async fn complete(
        &self,
        key: &str,
        response_status: u16,
        response_body: String,
    ) -> Result<(), IdempotencyError> {
        let expires_at = Utc::now() + self.completed_ttl();
        self.store
            .complete(key, response_status, response_body, expires_at)
            .await?;
        tracing::debug!(key, response_status, "Stored idempotent response");
        Ok(())
    }

    /// Release a pending claim after a failed or cancelled operation so the
    /// client can retry with the same key.
    pub async fn abandon(&self, key: &str) -> Result<(), IdempotencyError> {
        self.store.delete(key).await?;
        Ok(())
    }

    /// Unconditionally store a completed record for `key`, overwriting any
    /// prior entry. Only reached after a check has confirmed no valid
    /// duplicate exists, so the overwrite is expected for fresh or expired
    /// keys.
    pub async fn store_response(
        &self,
        key: &str,
        request_hash: &str,
        response_status: u16,
        response_body: String,
        context: &RequestContext,
    ) -> Result<(), IdempotencyError> {
        let now = Utc::now();
        let record = IdempotencyRecord {
            id: Uuid::new_v4(),
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            state: RecordState::Completed,
            response_status: Some(response_status),
            response_body: Some(response_body),
            user_id: context.user_id.clone(),
            organization_id: context.organization_id.clone(),
            endpoint: context.endpoint.clone(),
            created_at: now,
            expires_at: now + self.completed_ttl(),
        };
        self.store.put(record).await?;
        Ok(())
    }

    pub async fn sweep_expired(&self) -> Result<u64, IdempotencyError> {
        let removed = self.store.sweep_expired(Utc::now()).await?;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired idempotency records");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<StoreStats, IdempotencyError> {
        self.store.stats(Utc::now()).await.map_err(Into::into)
    }

    pub async fn clear(&self) -> Result<(), IdempotencyError> {
        self.store.clear().await.map_err(Into::into)
    }

    fn pending_record(
        &self,
        key: &str,
        request_hash: &str,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> IdempotencyRecord {
        IdempotencyRecord {
            id: Uuid::new_v4(),
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            state: RecordState::Pending,
            response_status: None,
            response_body: None,
            user_id: context.user_id.clone(),
            organization_id: context.organization_id.clone(),
            endpoint: context.endpoint.clone(),
            created_at: now,
            expires_at: now + self.pending_ttl(),
        }
    }

    fn completed_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.expiration.as_secs() as i64)
    }

    fn pending_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.pending_expiration.as_secs() as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn service() -> IdempotencyService {
        IdempotencyService::new(IdempotencyConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn service_with_ttls(completed: Duration, pending: Duration) -> IdempotencyService {
        let config = IdempotencyConfig {
            expiration: completed,
            pending_expiration: pending,
            ..IdempotencyConfig::default()
        };
        IdempotencyService::new(config, Arc::new(MemoryStore::new()))
    }

    fn ctx(user: Option<&str>) -> RequestContext {
        RequestContext {
            user_id: user.map(str::to_string),
            organization_id: None,
            endpoint: Some("create_order".to_string()),
        }
    }

    #[tokio::test]
    async fn first_call_is_fresh_and_replay_follows_completion() {
        let service = service();
        let hash = service
            .request_hash("POST", "/orders", Some(&json!({"sku": "X1", "qty": 2})), None)
            .unwrap();

        let outcome = service.begin("ord-abcdef12", &hash, &ctx(None)).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Fresh));

        service
            .complete("ord-abcdef12", 201, "{\"orderId\":\"o-1\"}".to_string())
            .await
            .unwrap();

        match service.begin("ord-abcdef12", &hash, &ctx(None)).await.unwrap() {
            BeginOutcome::Replay { record } => {
                assert_eq!(record.response_status, Some(201));
                assert_eq!(record.response_body.as_deref(), Some("{\"orderId\":\"o-1\"}"));
            }
            BeginOutcome::Fresh => panic!("second call must replay"),
        }
    }

    #[tokio::test]
    async fn reused_key_with_different_payload_conflicts() {
        let service = service();
        let h1 = service
            .request_hash("POST", "/orders", Some(&json!({"qty": 2})), None)
            .unwrap();
        let h2 = service
            .request_hash("POST", "/orders", Some(&json!({"qty": 3})), None)
            .unwrap();

        service.begin("ord-abcdef12", &h1, &ctx(None)).await.unwrap();
        service.complete("ord-abcdef12", 201, "{}".to_string()).await.unwrap();

        let err = service.begin("ord-abcdef12", &h2, &ctx(None)).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::Conflict { .. }));

        // The original response is untouched by the conflicting attempt.
        let replay = service.check("ord-abcdef12", &h1, &ctx(None)).await.unwrap();
        assert!(replay.is_duplicate);
    }

    #[tokio::test]
    async fn concurrent_duplicate_sees_in_progress() {
        let service = service();
        service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();

        let err = service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::InProgress { .. }));

        let err = service.check("ord-abcdef12", "h1", &ctx(None)).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::InProgress { .. }));
    }

    #[tokio::test]
    async fn racing_begins_admit_exactly_one_winner() {
        let service = service();

        let context = ctx(None);
        let (a, b) = tokio::join!(
            service.begin("ord-abcdef12", "h1", &context),
            service.begin("ord-abcdef12", "h1", &context),
        );

        let results = [a, b];
        let fresh = results
            .iter()
            .filter(|r| matches!(r, Ok(BeginOutcome::Fresh)))
            .count();
        let in_progress = results
            .iter()
            .filter(|r| matches!(r, Err(IdempotencyError::InProgress { .. })))
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(in_progress, 1);
    }

    #[tokio::test]
    async fn cross_tenant_replay_is_a_conflict() {
        let service = service();
        service
            .begin("ord-abcdef12", "h1", &ctx(Some("u1")))
            .await
            .unwrap();
        service.complete("ord-abcdef12", 200, "{}".to_string()).await.unwrap();

        let err = service
            .begin("ord-abcdef12", "h1", &ctx(Some("u2")))
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Conflict { .. }));

        let err = service
            .check("ord-abcdef12", "h1", &ctx(Some("u2")))
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Conflict { .. }));
    }

    #[tokio::test]
    async fn expiry_releases_the_key() {
        let service = service_with_ttls(Duration::from_secs(0), Duration::from_secs(0));
        service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        service.complete("ord-abcdef12", 200, "{}".to_string()).await.unwrap();

        // TTL of zero puts expires_at in the past immediately.
        let result = service.check("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        assert!(!result.is_duplicate);

        let outcome = service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Fresh));
    }

    #[tokio::test]
    async fn abandoned_key_is_immediately_retryable() {
        let service = service();
        service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        service.abandon("ord-abcdef12").await.unwrap();

        let outcome = service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Fresh));
    }

    #[tokio::test]
    async fn begin_rejects_invalid_keys() {
        let service = service();
        let err = service.begin("short", "h1", &ctx(None)).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidKey));
    }

    #[tokio::test]
    async fn store_response_overwrites_unconditionally() {
        let service = service();
        service
            .store_response("ord-abcdef12", "h1", 200, "{\"v\":1}".to_string(), &ctx(None))
            .await
            .unwrap();
        service
            .store_response("ord-abcdef12", "h1", 201, "{\"v\":2}".to_string(), &ctx(None))
            .await
            .unwrap();

        let result = service.check("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        let record = result.record.unwrap();
        assert_eq!(record.response_status, Some(201));
        assert_eq!(record.response_body.as_deref(), Some("{\"v\":2}"));
    }

    #[tokio::test]
    async fn stats_and_clear_round_trip() {
        let service = service();
        service.begin("ord-abcdef12", "h1", &ctx(None)).await.unwrap();
        service.complete("ord-abcdef12", 200, "{}".to_string()).await.unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_records, 1);

        service.clear().await.unwrap();
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_records, 0);
    }

    #[tokio::test]
    async fn lazy_sweep_runs_on_check() {
        let service = service_with_ttls(Duration::from_secs(0), Duration::from_secs(0));
        service
            .store_response("ord-abcdef12", "h1", 200, "{}".to_string(), &ctx(None))
            .await
            .unwrap();

        // The expired record is swept during an unrelated lookup.
        let result = service.check("unrelated-key", "h2", &ctx(None)).await.unwrap();
        assert!(!result.is_duplicate);
        assert_eq!(service.stats().await.unwrap().total_records, 0);
    }
}
