use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an idempotency record.
///
/// `Pending` marks a key claimed by an in-flight request so a concurrent
/// duplicate can be rejected instead of double-executing the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Completed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RecordState::Pending),
            "completed" => Some(RecordState::Completed),
            _ => None,
        }
    }
}

/// Identity under which a guarded request runs. Captured on first execution
/// and compared on replay so one tenant cannot replay another's response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    /// Descriptive label of the operation, for diagnostics only.
    pub endpoint: Option<String>,
}

impl RequestContext {
    /// True when `self` carries an identity that contradicts the one stored
    /// on `other`. A side with no identity never contradicts anything.
    pub fn conflicts_with(&self, other: &RequestContext) -> bool {
        fn differs(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x != y)
        }
        differs(&self.user_id, &other.user_id)
            || differs(&self.organization_id, &other.organization_id)
    }
}

/// The sole persisted entity: one record per idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key: String,
    pub request_hash: String,
    pub state: RecordState,
    pub response_status: Option<u16>,
    /// Original response payload, stored verbatim for replay.
    pub response_body: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn context(&self) -> RequestContext {
        RequestContext {
            user_id: self.user_id.clone(),
            organization_id: self.organization_id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user: Option<&str>, org: Option<&str>) -> RequestContext {
        RequestContext {
            user_id: user.map(str::to_string),
            organization_id: org.map(str::to_string),
            endpoint: None,
        }
    }

    #[test]
    fn context_conflicts_only_on_differing_identities() {
        assert!(ctx(Some("u1"), None).conflicts_with(&ctx(Some("u2"), None)));
        assert!(ctx(None, Some("o1")).conflicts_with(&ctx(None, Some("o2"))));
        assert!(!ctx(Some("u1"), None).conflicts_with(&ctx(Some("u1"), None)));
        assert!(!ctx(None, None).conflicts_with(&ctx(Some("u1"), Some("o1"))));
        assert!(!ctx(Some("u1"), None).conflicts_with(&ctx(None, None)));
    }

    #[test]
    fn record_state_round_trips_through_str() {
        for state in [RecordState::Pending, RecordState::Completed] {
            assert_eq!(RecordState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RecordState::parse("in_limbo"), None);
    }
}
