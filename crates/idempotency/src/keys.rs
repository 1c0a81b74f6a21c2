//! Idempotency key helpers: random generation, deterministic derivation from
//! a semantic context, and validation.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::hash::{canonicalize, sha256_hex};

pub const KEY_MIN_LEN: usize = 8;
pub const KEY_MAX_LEN: usize = 255;

/// Length of keys produced by [`generate_key_from_context`] (hex chars).
const CONTEXT_KEY_LEN: usize = 32;

/// Inputs for a deterministic key: the same context always derives the same
/// key, so retries of "this operation for this user at this minute" collapse
/// onto one record without the client having to persist a token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyContext {
    pub user_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
}

/// Fresh random key with UUID-grade entropy.
pub fn generate_key() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic key derived from the canonical JSON of `context`.
pub fn generate_key_from_context(context: &KeyContext) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(context)?;
    let bytes = serde_json::to_vec(&canonicalize(&value))?;
    let mut hex = sha256_hex(&bytes);
    hex.truncate(CONTEXT_KEY_LEN);
    Ok(hex)
}

/// True iff `key` has a length in `[KEY_MIN_LEN, KEY_MAX_LEN]`. Keys failing
/// this check must be rejected before any hashing or store access.
pub fn validate_key(key: &str) -> bool {
    (KEY_MIN_LEN..=KEY_MAX_LEN).contains(&key.chars().count())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn generated_keys_are_unique_and_valid() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert!(validate_key(&a));
    }

    #[test]
    fn context_keys_are_deterministic() {
        let context = KeyContext {
            user_id: "u-1".to_string(),
            operation: "create_order".to_string(),
            timestamp: Some(1_700_000_000),
            additional_data: Some(json!({"sku": "X1"})),
        };
        let a = generate_key_from_context(&context).unwrap();
        let b = generate_key_from_context(&context).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(validate_key(&a));
    }

    #[test]
    fn context_keys_differ_across_contexts() {
        let base = KeyContext {
            user_id: "u-1".to_string(),
            operation: "create_order".to_string(),
            timestamp: None,
            additional_data: None,
        };
        let mut other_user = base.clone();
        other_user.user_id = "u-2".to_string();
        let mut other_op = base.clone();
        other_op.operation = "cancel_order".to_string();

        let key = generate_key_from_context(&base).unwrap();
        assert_ne!(key, generate_key_from_context(&other_user).unwrap());
        assert_ne!(key, generate_key_from_context(&other_op).unwrap());
    }

    #[test]
    fn validate_key_boundaries() {
        assert!(!validate_key(""));
        assert!(!validate_key(&"a".repeat(7)));
        assert!(validate_key(&"a".repeat(8)));
        assert!(validate_key(&"a".repeat(255)));
        assert!(!validate_key(&"a".repeat(256)));
    }
}
