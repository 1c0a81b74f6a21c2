use thiserror::Error;

/// Failure of the backing record store. Store failures are hard errors: the
/// guarded operation must not proceed unguarded, so callers fail the request
/// instead of risking a double execution.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency record not found for key")]
    RecordNotFound,
    #[error("idempotency store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("invalid idempotency key: must be between 8 and 255 characters")]
    InvalidKey,
    /// The key was reused with a different request hash or by a different
    /// owning context. Not retryable with the same key.
    #[error("idempotency key '{key}' already used with different request parameters")]
    Conflict { key: String },
    /// A concurrent request holding the same key has not finished yet.
    #[error("request with idempotency key '{key}' is in progress; retry shortly")]
    InProgress { key: String },
    /// A completed record has no stored response to replay. Indicates store
    /// corruption; surfaced rather than silently re-executing.
    #[error("idempotency record for key '{key}' is completed but has no stored response")]
    MissingResponse { key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to serialize idempotency payload: {0}")]
    Serialization(#[from] serde_json::Error),
}
