use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idempotency::{
    ClaimOutcome, IdempotencyRecord, IdempotencyStore, RecordState, StoreError, StoreStats,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};

use crate::entities::idempotency_record;

/// [`IdempotencyStore`] backed by sea-orm. The claim is an insert against the
/// unique key index: of two concurrent inserts, one fails and re-reads the
/// winner's record, so the check-then-store sequence cannot double-execute.
#[derive(Clone)]
pub struct DbStore {
    conn: DatabaseConnection,
}

impl DbStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    async fn find_by_key(
        &self,
        key: &str,
    ) -> Result<Option<idempotency_record::Model>, StoreError> {
        idempotency_record::Entity::find()
            .filter(idempotency_record::Column::Key.eq(key))
            .one(&self.conn)
            .await
            .map_err(backend)
    }
}

fn backend(err: sea_orm::DbErr) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

fn from_model(model: idempotency_record::Model) -> Result<IdempotencyRecord, StoreError> {
    let state = RecordState::parse(&model.state).ok_or_else(|| {
        StoreError::Backend(anyhow::anyhow!(
            "unknown idempotency record state: {}",
            model.state
        ))
    })?;
    Ok(IdempotencyRecord {
        id: model.uuid,
        key: model.key,
        request_hash: model.request_hash,
        state,
        response_status: model.response_status.map(|status| status as u16),
        response_body: model.response_body,
        user_id: model.user_id,
        organization_id: model.organization_id,
        endpoint: model.endpoint,
        created_at: model.created_at,
        expires_at: model.expires_at,
    })
}

fn to_active_model(record: &IdempotencyRecord) -> idempotency_record::ActiveModel {
    idempotency_record::ActiveModel {
        uuid: Set(record.id),
        key: Set(record.key.clone()),
        request_hash: Set(record.request_hash.clone()),
        state: Set(record.state.as_str().to_string()),
        response_status: Set(record.response_status.map(i32::from)),
        response_body: Set(record.response_body.clone()),
        user_id: Set(record.user_id.clone()),
        organization_id: Set(record.organization_id.clone()),
        endpoint: Set(record.endpoint.clone()),
        created_at: Set(record.created_at),
        expires_at: Set(record.expires_at),
        ..Default::default()
    }
}

#[async_trait]
impl IdempotencyStore for DbStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.find_by_key(key).await?.map(from_model).transpose()
    }

    async fn claim(&self, record: IdempotencyRecord) -> Result<ClaimOutcome, StoreError> {
        match to_active_model(&record).insert(&self.conn).await {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(err) => {
                // Likely a concurrent insert on the unique key index; load the
                // winner and let the caller classify it.
                if let Some(existing) = self.find_by_key(&record.key).await? {
                    return Ok(ClaimOutcome::Existing(from_model(existing)?));
                }
                Err(backend(err))
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
        let model = self
            .find_by_key(key)
            .await?
            .ok_or(StoreError::RecordNotFound)?;

        let mut active: idempotency_record::ActiveModel = model.into();
        active.state = Set(RecordState::Completed.as_str().to_string());
        active.response_status = Set(Some(i32::from(response_status)));
        active.response_body = Set(Some(response_body));
        active.expires_at = Set(expires_at);
        active.update(&self.conn).await.map_err(backend)?;
        Ok(())
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        idempotency_record::Entity::delete_many()
            .filter(idempotency_record::Column::Key.eq(record.key.as_str()))
            .exec(&self.conn)
            .await
            .map_err(backend)?;
        to_active_model(&record)
            .insert(&self.conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        idempotency_record::Entity::delete_many()
            .filter(idempotency_record::Column::Key.eq(key))
            .exec(&self.conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = idempotency_record::Entity::delete_many()
            .filter(idempotency_record::Column::ExpiresAt.lt(now))
            .exec(&self.conn)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        idempotency_record::Entity::delete_many()
            .exec(&self.conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let total_records = idempotency_record::Entity::find()
            .count(&self.conn)
            .await
            .map_err(backend)?;
        let expired_records = idempotency_record::Entity::find()
            .filter(idempotency_record::Column::ExpiresAt.lt(now))
            .count(&self.conn)
            .await
            .map_err(backend)?;

        // Diagnostic estimate only; loading every row is acceptable at the
        // record counts a 24h TTL leaves behind.
        let mut memory_usage_estimate = 0u64;
        let models = idempotency_record::Entity::find()
            .all(&self.conn)
            .await
            .map_err(backend)?;
        for model in models {
            let record = from_model(model)?;
            if let Ok(serialized) = serde_json::to_string(&record) {
                memory_usage_estimate += serialized.len() as u64;
            }
        }

        Ok(StoreStats {
            total_records,
            expired_records,
            memory_usage_estimate,
        })
    }
}
