//! Usage accounting value objects.
//!
//! A [`UsageRecord`] is produced once per completed request and drives
//! the durable spend pipeline; a [`RequestEvent`] is the lossy-tolerant
//! metrics sibling folded into hourly/daily rollups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::ProviderType;

/// One completed request, as enqueued for reconciliation.
///
/// Invariants: `total_tokens = input_tokens + output_tokens`, `cost >= 0`.
/// `actual_user_id` may differ from `user_id` when a team or system key is
/// used on behalf of a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,

    /// Logical model the client asked for.
    pub model: String,
    pub provider: ProviderType,
    pub instance_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_slug: Option<String>,

    /// The provider's canonical model name.
    pub provider_model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub key_type: String,

    /// Owner of the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Principal at the time of the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    pub method: String,
    pub path: String,
    pub status_code: u16,

    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,

    /// Actual cost in USD computed from the pricing catalog.
    pub cost: f64,

    /// The admission-time estimate, kept so the reconciliation worker can
    /// correct the cached spend by `cost - estimated_cost`.
    #[serde(default)]
    pub estimated_cost: f64,

    pub latency_ms: u64,

    #[serde(default)]
    pub retries: u32,
}

impl UsageRecord {
    /// Enforce the token-sum invariant at construction sites.
    pub fn with_tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self.total_tokens = input + output;
        self
    }
}

/// Fire-and-forget metrics event appended to the `usage_events` stream.
///
/// Dropping one of these never affects spend correctness, only metrics
/// fidelity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: ProviderType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,

    #[serde(default)]
    pub cache_hit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UsageRecord {
        UsageRecord {
            request_id: "req-1".into(),
            timestamp: Utc::now(),
            model: "gpt-4".into(),
            provider: ProviderType::Openai,
            instance_id: "gpt-4/primary".into(),
            route_slug: None,
            provider_model: "gpt-4-0613".into(),
            key_id: Some("k1".into()),
            key_type: "api".into(),
            user_id: Some("u1".into()),
            actual_user_id: Some("u2".into()),
            team_id: None,
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            status_code: 200,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            estimated_cost: 0.0,
            latency_ms: 120,
            retries: 0,
        }
    }

    #[test]
    fn with_tokens_maintains_sum_invariant() {
        let r = record().with_tokens(100, 42);
        assert_eq!(r.total_tokens, 142);
    }

    #[test]
    fn actual_user_may_differ_from_owner() {
        let r = record();
        assert_ne!(r.user_id, r.actual_user_id);
    }

    #[test]
    fn record_round_trips_json() {
        let r = record().with_tokens(10, 5);
        let json = serde_json::to_string(&r).unwrap();
        let back: UsageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_tokens, 15);
        assert_eq!(back.instance_id, "gpt-4/primary");
    }
}
