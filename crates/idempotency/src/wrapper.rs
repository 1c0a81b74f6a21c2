//! Function-call adapter: the same at-most-once guarantee for internal
//! service calls rather than HTTP requests.
//!
//! An explicit higher-order wrapper instead of attribute machinery, so the
//! guard is visible at the call site. The key travels as an
//! `idempotency_key` field on the call's argument object and is stripped
//! before hashing, so the key never participates in its own hash.

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::IdempotencyError,
    keys::validate_key,
    record::RequestContext,
    service::{BeginOutcome, IdempotencyService},
};

pub const KEY_FIELD: &str = "idempotency_key";

/// Extract the idempotency key from a call's argument object, if any.
pub fn key_from_args(args: &Value) -> Option<String> {
    args.get(KEY_FIELD)
        .and_then(Value::as_str)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

fn args_without_key(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.shift_remove(KEY_FIELD);
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}

/// Guard `execute` with idempotency derived from `args`.
///
/// Without a key the call proceeds unguarded. On a duplicate the stored
/// result is returned without invoking `execute`; on success the result is
/// stored before being returned; on failure nothing is stored and the key
/// stays retryable.
pub async fn with_idempotency<T, F, Fut, E>(
    service: &IdempotencyService,
    operation: &str,
    args: &Value,
    execute: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<IdempotencyError>,
{
    let Some(key) = key_from_args(args) else {
        return execute().await;
    };
    if !validate_key(&key) {
        return Err(IdempotencyError::InvalidKey.into());
    }

    let hashed_args = args_without_key(args);
    let request_hash = service
        .request_hash("CALL", operation, Some(&hashed_args), None)
        .map_err(E::from)?;
    let context = RequestContext {
        endpoint: Some(operation.to_string()),
        ..Default::default()
    };

    match service
        .begin(&key, &request_hash, &context)
        .await
        .map_err(E::from)?
    {
        BeginOutcome::Replay { record } => {
            let body = record
                .response_body
                .ok_or_else(|| IdempotencyError::MissingResponse { key: key.clone() })
                .map_err(E::from)?;
            let result: T = serde_json::from_str(&body)
                .map_err(IdempotencyError::from)
                .map_err(E::from)?;
            Ok(result)
        }
        BeginOutcome::Fresh => match execute().await {
            Ok(result) => {
                let body = serde_json::to_string(&result)
                    .map_err(IdempotencyError::from)
                    .map_err(E::from)?;
                service.complete(&key, 200, body).await.map_err(E::from)?;
                Ok(result)
            }
            Err(err) => {
                // Best-effort release so retries with the same key proceed.
                if let Err(cleanup_err) = service.abandon(&key).await {
                    tracing::warn!(
                        key,
                        error = %cleanup_err,
                        "Failed to release idempotency claim after call error"
                    );
                }
                Err(err)
            }
        },
    }
}
