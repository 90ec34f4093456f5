//! Row types for the durable tables.
//!
//! Shapes mirror the logical schema: `users`, `teams`, `team_members`,
//! `keys`, `budgets`, `usage_logs`, `audits`, and the four metrics
//! tables. Arrays are Postgres `text[]`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: Option<String>,
    /// admin | manager | user | viewer
    pub role: String,
    pub max_budget: Option<f64>,
    pub current_spend: f64,
    pub tpm: Option<i32>,
    pub rpm: Option<i32>,
    pub budget_period: Option<String>,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TeamRecord {
    pub id: String,
    pub name: Option<String>,
    pub max_budget: Option<f64>,
    pub current_spend: f64,
    pub budget_period: Option<String>,
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub tpm: Option<i32>,
    pub rpm: Option<i32>,
    pub max_parallel: Option<i32>,
    pub allowed_models: Vec<String>,
    pub blocked_models: Vec<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TeamMemberRecord {
    pub team_id: String,
    pub user_id: String,
    /// owner | admin | member | viewer
    pub role: String,
    pub max_budget: Option<f64>,
    pub tpm: Option<i32>,
    pub rpm: Option<i32>,
    pub current_spend: f64,
}

/// A stored credential. Plaintext never lands here: `key_hash` is the
/// SHA-256 of the bearer, `key_prefix` its first 8 hex chars.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub key_hash: String,
    pub key_prefix: String,
    /// api | virtual | master | system
    pub key_type: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub allowed_models: Vec<String>,
    pub blocked_models: Vec<String>,
    pub rpm: Option<i32>,
    pub tpm: Option<i32>,
    pub max_parallel: Option<i32>,
    pub max_budget: Option<f64>,
    /// daily | weekly | monthly | yearly
    pub budget_period: Option<String>,
    pub current_spend: f64,
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

impl KeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_budget_exceeded(&self) -> bool {
        self.max_budget.is_some_and(|max| self.current_spend >= max)
    }

    /// Usable iff active, unexpired, unrevoked, and within budget.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now) && !self.is_revoked() && !self.is_budget_exceeded()
    }
}

/// A monitored spend ceiling.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub id: String,
    pub name: String,
    /// global | user | team | key
    pub budget_type: String,
    /// Entity id; empty for global budgets.
    pub entity_ref: String,
    pub amount: f64,
    pub spent: f64,
    /// daily | weekly | monthly | yearly | custom
    pub period: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Alert threshold as a percentage of `amount`.
    pub alert_at: f64,
    pub alert_sent: bool,
    /// Ordered actions taken at the alert threshold:
    /// alert | throttle | block | webhook.
    pub actions: Vec<String>,
    pub is_active: bool,
}

impl BudgetRecord {
    pub fn is_exceeded(&self) -> bool {
        self.spent >= self.amount
    }

    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= now && self.ends_at.is_none_or(|end| now < end)
    }
}

/// One durable usage row, written by the reconciliation worker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageLogRow {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub instance_id: String,
    pub provider_model: String,
    pub key_id: Option<String>,
    pub key_type: String,
    pub user_id: Option<String>,
    pub actual_user_id: Option<String>,
    pub team_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub cost: f64,
    pub latency_ms: i64,
    pub retries: i32,
}

/// Aggregated interval row shared by the four metrics tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRow {
    /// "hourly" or "daily".
    pub interval: String,
    pub bucket_start: Option<DateTime<Utc>>,
    /// Model name, user id, team id, or "system".
    pub dimension: String,
    pub request_count: i64,
    pub success_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub p50_latency_ms: i64,
    pub p95_latency_ms: i64,
    pub p99_latency_ms: i64,
    /// Success rate weighted by latency, 0..=100.
    pub health_score: f64,
    pub cache_hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> KeyRecord {
        KeyRecord {
            id: "k1".into(),
            key_hash: "ab".repeat(32),
            key_prefix: "abababab".into(),
            key_type: "api".into(),
            user_id: Some("u1".into()),
            team_id: None,
            is_active: true,
            expires_at: None,
            revoked_at: None,
            scopes: vec![],
            allowed_models: vec![],
            blocked_models: vec![],
            rpm: None,
            tpm: None,
            max_parallel: None,
            max_budget: None,
            budget_period: None,
            current_spend: 0.0,
            budget_reset_at: None,
            usage_count: 0,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }

    #[test]
    fn fresh_key_is_usable() {
        assert!(key().is_usable(Utc::now()));
    }

    #[test]
    fn expired_key_is_unusable() {
        let mut k = key();
        k.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(!k.is_usable(Utc::now()));
    }

    #[test]
    fn revoked_key_is_unusable() {
        let mut k = key();
        k.revoked_at = Some(Utc::now());
        assert!(!k.is_usable(Utc::now()));
    }

    #[test]
    fn over_budget_key_is_unusable() {
        let mut k = key();
        k.max_budget = Some(1.0);
        k.current_spend = 1.0;
        assert!(k.is_budget_exceeded());
        assert!(!k.is_usable(Utc::now()));
    }

    #[test]
    fn budget_window_checks() {
        let now = Utc::now();
        let budget = BudgetRecord {
            id: "b1".into(),
            name: "team monthly".into(),
            budget_type: "team".into(),
            entity_ref: "t1".into(),
            amount: 100.0,
            spent: 100.0,
            period: "monthly".into(),
            starts_at: now - Duration::days(1),
            ends_at: Some(now + Duration::days(29)),
            alert_at: 80.0,
            alert_sent: false,
            actions: vec!["alert".into()],
            is_active: true,
        };
        assert!(budget.is_exceeded());
        assert!(budget.is_in_window(now));
        assert!(!budget.is_in_window(now + Duration::days(30)));
    }
}
