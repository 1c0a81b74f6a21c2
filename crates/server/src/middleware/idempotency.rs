//! HTTP adapter for the idempotency layer.
//!
//! Guards mutating methods only; the guard is opt-in per request via the
//! `Idempotency-Key` header. Fresh requests run the inner handler with the
//! response captured and recorded on success; duplicates get the recorded
//! response verbatim plus a replay marker header.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use idempotency::{
    BeginOutcome, IdempotencyError, RequestContext, hash::sha256_hex, keys::validate_key,
};
use serde_json::{Value, json};

use crate::{error::ApiError, state::AppState};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const REPLAY_HEADER: &str = "X-Idempotent-Replay";

const USER_ID_HEADER: &str = "X-User-Id";
const ORGANIZATION_ID_HEADER: &str = "X-Organization-Id";

pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Owning context for the request, populated by the host's auth layer via
/// identity headers.
fn request_context(headers: &HeaderMap, method: &Method, path: &str) -> RequestContext {
    RequestContext {
        user_id: header_value(headers, USER_ID_HEADER),
        organization_id: header_value(headers, ORGANIZATION_ID_HEADER),
        endpoint: Some(format!("{method} {path}")),
    }
}

pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // Safe and idempotent-by-definition methods bypass the layer entirely.
    if !matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
        return next.run(request).await;
    }
    let Some(key) = idempotency_key(request.headers()) else {
        return next.run(request).await;
    };

    match guard(&state, &key, request, next).await {
        Ok(response) => response,
        Err(err) => with_key_header(err.into_response(), &key),
    }
}

async fn guard(
    state: &AppState,
    key: &str,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !validate_key(key) {
        return Err(IdempotencyError::InvalidKey.into());
    }

    let context = request_context(request.headers(), request.method(), request.uri().path());
    let header_pairs: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let (parts, body) = request.into_parts();
    // `to_bytes` bails as soon as the limit is crossed, so an oversized body
    // is never held in memory.
    let max_bytes = state.idempotency.config().max_body_size;
    let bytes = to_bytes(body, max_bytes).await.map_err(|_| {
        ApiError::PayloadTooLarge(format!("Request body exceeds the {max_bytes} byte limit"))
    })?;
    let body_value = normalized_body(&bytes);
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let request_hash = state.idempotency.request_hash(
        parts.method.as_str(),
        &url,
        body_value.as_ref(),
        Some(header_pairs.as_slice()),
    )?;

    match state.idempotency.begin(key, &request_hash, &context).await? {
        BeginOutcome::Replay { record } => {
            let status = record
                .response_status
                .and_then(|status| StatusCode::from_u16(status).ok())
                .ok_or_else(|| IdempotencyError::MissingResponse {
                    key: key.to_string(),
                })?;
            let body = record
                .response_body
                .ok_or_else(|| IdempotencyError::MissingResponse {
                    key: key.to_string(),
                })?;
            let response = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .header(REPLAY_HEADER, "true")
                .body(Body::from(body))
                .map_err(|err| ApiError::Internal(format!("Failed to build replay: {err}")))?;
            Ok(with_key_header(response, key))
        }
        BeginOutcome::Fresh => {
            let request = Request::from_parts(parts, Body::from(bytes));
            let response = next.run(request).await;

            let (parts, body) = response.into_parts();
            let body_bytes = match to_bytes(body, usize::MAX).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    release_claim(state, key).await;
                    return Err(ApiError::Internal(format!(
                        "Failed to buffer response body: {err}"
                    )));
                }
            };

            if parts.status.is_success() {
                // Responses are replayed verbatim, so a body that cannot be
                // stored losslessly as text is not cached at all.
                match String::from_utf8(body_bytes.to_vec()) {
                    Ok(body) => {
                        state
                            .idempotency
                            .complete(key, parts.status.as_u16(), body)
                            .await?;
                    }
                    Err(_) => {
                        tracing::warn!(key, "Response body is not UTF-8; skipping replay cache");
                        release_claim(state, key).await;
                    }
                }
            } else {
                // Failures are never cached; the key stays retryable.
                release_claim(state, key).await;
            }

            let response = Response::from_parts(parts, Body::from(body_bytes));
            Ok(with_key_header(response, key))
        }
    }
}

/// Non-JSON bodies are hashed by digest, mirroring the oversized-body path.
fn normalized_body(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Some(value),
        Err(_) => Some(json!({
            "digest": sha256_hex(bytes),
            "length": bytes.len(),
        })),
    }
}

async fn release_claim(state: &AppState, key: &str) {
    if let Err(err) = state.idempotency.abandon(key).await {
        tracing::warn!(key, error = %err, "Failed to release idempotency claim");
    }
}

/// Every response the layer touches echoes the key back to the client.
fn with_key_header(mut response: Response, key: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(key) {
        response.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, value);
    }
    response
}
