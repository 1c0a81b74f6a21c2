//! Request normalization and hashing.
//!
//! Two semantically identical JSON payloads must hash identically regardless
//! of object key order, so object keys are sorted recursively before
//! serialization. Array element order is preserved and therefore significant.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::config::IdempotencyConfig;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

/// Recursively sort object keys. Arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonicalize a body for hashing. Bodies whose canonical serialization
/// exceeds `max_body_size` are replaced by a digest plus byte length, which
/// bounds hashing cost on oversized payloads.
fn normalize_body(body: &Value, max_body_size: usize) -> Result<Value, serde_json::Error> {
    let canonical = canonicalize(body);
    let bytes = serde_json::to_vec(&canonical)?;
    if bytes.len() > max_body_size {
        return Ok(json!({
            "digest": sha256_hex(&bytes),
            "length": bytes.len(),
        }));
    }
    Ok(canonical)
}

/// Lowercase names, drop excluded headers, sort. `None` when nothing is left
/// so an empty header block never perturbs the hash.
fn normalize_headers(headers: &[(String, String)], exclude: &[String]) -> Option<Value> {
    let mut kept: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .filter(|(name, _)| !exclude.iter().any(|ex| ex == name))
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.sort();
    let mut map = Map::new();
    for (name, value) in kept {
        map.insert(name, Value::String(value.to_string()));
    }
    Some(Value::Object(map))
}

/// Digest over the canonical serialization of `{body, headers, method, url}`.
///
/// Deterministic: the same logical request always yields the same hash.
/// Headers participate only when `include_headers` is set, and sensitive
/// headers are stripped first so auth tokens never make semantically
/// identical requests hash differently.
pub fn request_hash(
    method: &str,
    url: &str,
    body: Option<&Value>,
    headers: Option<&[(String, String)]>,
    config: &IdempotencyConfig,
) -> Result<String, serde_json::Error> {
    let mut envelope = Map::new();
    if let Some(body) = body {
        envelope.insert("body".to_string(), normalize_body(body, config.max_body_size)?);
    }
    if config.include_headers
        && let Some(headers) = headers
        && let Some(normalized) = normalize_headers(headers, &config.exclude_headers)
    {
        envelope.insert("headers".to_string(), normalized);
    }
    envelope.insert(
        "method".to_string(),
        Value::String(method.to_ascii_uppercase()),
    );
    envelope.insert("url".to_string(), Value::String(url.to_string()));

    let bytes = serde_json::to_vec(&Value::Object(envelope))?;
    Ok(sha256_hex(&bytes))
}
