//! The Redis budget cache and admission control.
//!
//! Keyed `budget:{entity_type}:{entity_id}` with a JSON snapshot built
//! from the SQL budget table, plus a companion `:spent` float counter
//! mutated only with `INCRBYFLOAT`. Cache misses admit optimistically
//! and refresh asynchronously; every Redis touch on the hot path runs
//! under a one-second deadline and fails open.

use pllm_core::error::BudgetError;
use pllm_storage::PgStore;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Hard deadline for admission-path Redis calls.
const ADMISSION_DEADLINE: Duration = Duration::from_secs(1);

/// Cached budget snapshot for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedBudget {
    /// `limit - spent` at refresh time.
    pub available: f64,
    pub spent: f64,
    /// `None` when no budgets apply to the entity (unconstrained).
    pub limit: Option<f64>,
    pub exceeded: bool,
    /// Entities past an alert threshold whose budget asks for throttling.
    #[serde(default)]
    pub throttled: bool,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub ttl: u64,
}

impl CachedBudget {
    fn unconstrained(ttl: u64) -> Self {
        Self {
            available: 0.0,
            spent: 0.0,
            limit: None,
            exceeded: false,
            throttled: false,
            last_updated: chrono::Utc::now(),
            ttl,
        }
    }

    /// The pure admission rule. `pending` is spend accumulated in the
    /// companion counter since the snapshot was taken.
    pub fn decide(&self, pending: f64, estimated: f64) -> AdmissionDecision {
        if self.limit.is_none() {
            return AdmissionDecision::Allow;
        }
        if self.exceeded || self.available - pending - estimated < 0.0 {
            return AdmissionDecision::Deny;
        }
        if self.throttled {
            return AdmissionDecision::Throttle;
        }
        AdmissionDecision::Allow
    }
}

/// Outcome of an admission check across an entity chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    /// Admit, but the caller should tighten the rate limit.
    Throttle,
    Deny,
}

/// The cache. Cheap to clone (connection manager + pool handles).
#[derive(Clone)]
pub struct BudgetCache {
    redis: ConnectionManager,
    store: PgStore,
    ttl: Duration,
}

impl BudgetCache {
    pub fn new(redis: ConnectionManager, store: PgStore, ttl: Duration) -> Self {
        Self { redis, store, ttl }
    }

    fn state_key(entity_type: &str, entity_id: &str) -> String {
        format!("budget:{entity_type}:{entity_id}")
    }

    fn spent_key(entity_type: &str, entity_id: &str) -> String {
        format!("budget:{entity_type}:{entity_id}:spent")
    }

    /// Admission check for one entity.
    ///
    /// Redis trouble or deadline overrun fails open: blocking traffic on
    /// cache infrastructure is worse than briefly over-admitting.
    pub async fn check_available(
        &self,
        entity_type: &str,
        entity_id: &str,
        estimated_cost: f64,
    ) -> AdmissionDecision {
        let mut redis = self.redis.clone();
        let state_key = Self::state_key(entity_type, entity_id);
        let spent_key = Self::spent_key(entity_type, entity_id);

        let fetched = tokio::time::timeout(ADMISSION_DEADLINE, async {
            redis::cmd("MGET")
                .arg(&state_key)
                .arg(&spent_key)
                .query_async::<(Option<String>, Option<f64>)>(&mut redis)
                .await
        })
        .await;

        let (state_json, pending) = match fetched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(entity = %state_key, error = %e, "budget cache unavailable, failing open");
                return AdmissionDecision::Allow;
            }
            Err(_) => {
                warn!(entity = %state_key, "budget cache timed out, failing open");
                return AdmissionDecision::Allow;
            }
        };

        let Some(json) = state_json else {
            // Optimistic admit on miss; refresh fills the cache for the
            // next request.
            self.spawn_refresh(entity_type, entity_id);
            return AdmissionDecision::Allow;
        };

        match serde_json::from_str::<CachedBudget>(&json) {
            Ok(state) => state.decide(pending.unwrap_or(0.0), estimated_cost),
            Err(e) => {
                warn!(entity = %state_key, error = %e, "corrupt budget cache entry, refreshing");
                self.spawn_refresh(entity_type, entity_id);
                AdmissionDecision::Allow
            }
        }
    }

    /// Check the whole entity chain (key, team, user); the strictest
    /// decision wins.
    pub async fn check_entities(
        &self,
        entities: &[(&str, &str)],
        estimated_cost: f64,
    ) -> (AdmissionDecision, Option<(String, String)>) {
        let mut throttled = false;
        for (entity_type, entity_id) in entities {
            match self.check_available(entity_type, entity_id, estimated_cost).await {
                AdmissionDecision::Deny => {
                    return (
                        AdmissionDecision::Deny,
                        Some((entity_type.to_string(), entity_id.to_string())),
                    );
                }
                AdmissionDecision::Throttle => throttled = true,
                AdmissionDecision::Allow => {}
            }
        }
        if throttled {
            (AdmissionDecision::Throttle, None)
        } else {
            (AdmissionDecision::Allow, None)
        }
    }

    fn spawn_refresh(&self, entity_type: &str, entity_id: &str) {
        let cache = self.clone();
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(&entity_type, &entity_id).await {
                warn!(entity_type = %entity_type, entity_id = %entity_id, error = %e, "budget refresh failed");
            }
        });
    }

    /// Rebuild the cached snapshot from the SQL budget table: aggregate
    /// every active, in-window budget for the entity (global included)
    /// into totals, and reset the pending counter.
    pub async fn refresh(&self, entity_type: &str, entity_id: &str) -> Result<(), BudgetError> {
        let budgets = self
            .store
            .budgets_for(entity_type, entity_id)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))?;

        let state = if budgets.is_empty() {
            CachedBudget::unconstrained(self.ttl.as_secs())
        } else {
            let limit: f64 = budgets.iter().map(|b| b.amount).sum();
            let spent: f64 = budgets.iter().map(|b| b.spent).sum();
            let throttled = budgets.iter().any(|b| {
                b.amount > 0.0
                    && b.spent / b.amount * 100.0 >= b.alert_at
                    && b.alert_sent
                    && b.actions.iter().any(|a| a == "throttle")
            });
            CachedBudget {
                available: limit - spent,
                spent,
                limit: Some(limit),
                exceeded: budgets.iter().any(|b| b.is_exceeded()),
                throttled,
                last_updated: chrono::Utc::now(),
                ttl: self.ttl.as_secs(),
            }
        };

        let mut redis = self.redis.clone();
        let json = serde_json::to_string(&state)?;
        redis::pipe()
            .cmd("SET")
            .arg(Self::state_key(entity_type, entity_id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .ignore()
            .cmd("DEL")
            .arg(Self::spent_key(entity_type, entity_id))
            .ignore()
            .query_async::<()>(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))?;

        debug!(entity_type, entity_id, "budget cache refreshed");
        Ok(())
    }

    /// Post-call increment on the pending counter. Fire-and-forget from
    /// the handler's perspective.
    pub async fn increment_spent(
        &self,
        entity_type: &str,
        entity_id: &str,
        cost: f64,
    ) -> Result<(), BudgetError> {
        let mut redis = self.redis.clone();
        redis::pipe()
            .cmd("INCRBYFLOAT")
            .arg(Self::spent_key(entity_type, entity_id))
            .arg(cost)
            .ignore()
            .cmd("EXPIRE")
            .arg(Self::spent_key(entity_type, entity_id))
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async::<()>(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))
    }

    /// Reconciliation correction once the authoritative cost is known:
    /// `actual - estimated` may be negative.
    pub async fn correct_spent(
        &self,
        entity_type: &str,
        entity_id: &str,
        delta: f64,
    ) -> Result<(), BudgetError> {
        if delta == 0.0 {
            return Ok(());
        }
        self.increment_spent(entity_type, entity_id, delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(available: f64, exceeded: bool) -> CachedBudget {
        CachedBudget {
            available,
            spent: 0.0,
            limit: Some(100.0),
            exceeded,
            throttled: false,
            last_updated: chrono::Utc::now(),
            ttl: 300,
        }
    }

    #[test]
    fn allows_within_budget() {
        assert_eq!(state(10.0, false).decide(0.0, 5.0), AdmissionDecision::Allow);
    }

    #[test]
    fn denies_when_estimate_exceeds_available() {
        assert_eq!(state(0.01, false).decide(0.0, 0.02), AdmissionDecision::Deny);
    }

    #[test]
    fn denies_when_marked_exceeded() {
        assert_eq!(state(50.0, true).decide(0.0, 0.01), AdmissionDecision::Deny);
    }

    #[test]
    fn pending_counter_tightens_admission() {
        // 10 available, 8 already pending: a 3-dollar estimate must fail.
        assert_eq!(state(10.0, false).decide(8.0, 3.0), AdmissionDecision::Deny);
        assert_eq!(state(10.0, false).decide(8.0, 1.0), AdmissionDecision::Allow);
    }

    #[test]
    fn unconstrained_entity_always_allowed() {
        let state = CachedBudget::unconstrained(300);
        assert_eq!(state.decide(1e9, 1e9), AdmissionDecision::Allow);
    }

    #[test]
    fn throttled_entity_admits_with_throttle() {
        let mut s = state(50.0, false);
        s.throttled = true;
        assert_eq!(s.decide(0.0, 1.0), AdmissionDecision::Throttle);
    }

    #[test]
    fn cache_key_shapes() {
        assert_eq!(BudgetCache::state_key("team", "t1"), "budget:team:t1");
        assert_eq!(BudgetCache::spent_key("key", "k9"), "budget:key:k9:spent");
    }

    #[test]
    fn snapshot_round_trips_json() {
        let s = state(42.0, false);
        let json = serde_json::to_string(&s).unwrap();
        let back: CachedBudget = serde_json::from_str(&json).unwrap();
        assert_eq!(back.available, 42.0);
        assert_eq!(back.limit, Some(100.0));
    }
}
