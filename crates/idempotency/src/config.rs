use std::{env, time::Duration};

use tracing::warn;

const DEFAULT_TTL_HOURS: u64 = 24;
const DEFAULT_PENDING_TTL_SECS: u64 = 3600;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_EXCLUDE_HEADERS: &[&str] = &["authorization", "api-key", "cookie", "user-agent"];

/// Tunables for the idempotency layer. Constructed once at process start and
/// handed to [`crate::IdempotencyService`]; env overrides follow the `RG_`
/// prefix convention.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a completed record replays before the key becomes reusable.
    pub expiration: Duration,
    /// How long a pending claim blocks concurrent duplicates. Kept short so
    /// a crashed process cannot wedge a key for the full replay window.
    pub pending_expiration: Duration,
    /// Bodies larger than this are hashed as `{digest, length}` instead of
    /// being canonicalized in full.
    pub max_body_size: usize,
    /// Whether header values participate in the request hash.
    pub include_headers: bool,
    /// Header names (lowercase) stripped before optional inclusion.
    pub exclude_headers: Vec<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(DEFAULT_TTL_HOURS * 3600),
            pending_expiration: Duration::from_secs(DEFAULT_PENDING_TTL_SECS),
            max_body_size: DEFAULT_MAX_BODY_BYTES,
            include_headers: false,
            exclude_headers: DEFAULT_EXCLUDE_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(|name| env::var(name).ok())
    }

    fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ttl_hours = read_env_u64(
            "RG_IDEMPOTENCY_TTL_HOURS",
            DEFAULT_TTL_HOURS,
            &get_env,
        );
        let pending_ttl_secs = read_env_u64(
            "RG_IDEMPOTENCY_PENDING_TTL_SECS",
            DEFAULT_PENDING_TTL_SECS,
            &get_env,
        );
        let max_body_size = read_env_usize(
            "RG_IDEMPOTENCY_MAX_BODY_BYTES",
            defaults.max_body_size,
            &get_env,
        );
        let include_headers = read_env_bool(
            "RG_IDEMPOTENCY_INCLUDE_HEADERS",
            defaults.include_headers,
            &get_env,
        );
        let exclude_headers = match get_env("RG_IDEMPOTENCY_EXCLUDE_HEADERS") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            _ => defaults.exclude_headers.clone(),
        };

        Self {
            expiration: Duration::from_secs(ttl_hours.saturating_mul(3600)),
            pending_expiration: Duration::from_secs(pending_ttl_secs),
            max_body_size: normalize_max(
                max_body_size,
                "RG_IDEMPOTENCY_MAX_BODY_BYTES",
                defaults.max_body_size,
            ),
            include_headers,
            exclude_headers,
        }
    }
}

fn read_env_u64<F>(name: &str, default: u64, get_env: &F) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(name) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => value,
            Ok(_) => {
                warn!("{name} must be positive; using default {default}");
                default
            }
            Err(err) => {
                warn!(value = raw.trim(), error = %err, "Invalid {name}; using default");
                default
            }
        },
        None => default,
    }
}

fn read_env_usize<F>(name: &str, default: usize, get_env: &F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(name) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(value) => value,
            Err(err) => {
                warn!(value = raw.trim(), error = %err, "Invalid {name}; using default");
                default
            }
        },
        None => default,
    }
}

fn read_env_bool<F>(name: &str, default: bool, get_env: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => {
                warn!(value = other, "Invalid {name}; using default");
                default
            }
        },
        None => default,
    }
}

fn normalize_max(value: usize, name: &str, default: usize) -> usize {
    if value == 0 {
        warn!("{name} must be positive; using default {default}");
        default
    } else {
        value
    }
}
