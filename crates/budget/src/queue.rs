//! The Redis usage queue.
//!
//! `usage:queue:main` holds freshly enqueued records; failed batches are
//! parked on `usage:queue:retry:{due_ts}` lists with exponential backoff
//! and promoted back once due; records that exhaust their retries land
//! on `usage:queue:dead`.

use pllm_core::error::BudgetError;
use pllm_core::usage::UsageRecord;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MAIN_QUEUE: &str = "usage:queue:main";
const RETRY_PREFIX: &str = "usage:queue:retry:";
const DEAD_QUEUE: &str = "usage:queue:dead";

/// A usage record plus its delivery attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUsage {
    pub record: UsageRecord,
    #[serde(default)]
    pub attempts: u32,
}

/// Exponential backoff schedule in seconds: 1, 2, 4, ... capped at 60.
pub fn backoff_secs(attempts: u32) -> u64 {
    (1u64 << attempts.min(6)).min(60)
}

/// Producer/consumer handle on the usage queues.
#[derive(Clone)]
pub struct UsageQueue {
    redis: ConnectionManager,
}

impl UsageQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Enqueue one completed request. Callers treat this as
    /// fire-and-forget; a drop here only delays reconciliation until the
    /// client retries nothing — the spend pipeline is the loser, so we
    /// log loudly.
    pub async fn enqueue(&self, record: UsageRecord) -> Result<(), BudgetError> {
        let entry = QueuedUsage { record, attempts: 0 };
        let json = serde_json::to_string(&entry)?;
        let mut redis = self.redis.clone();
        redis::cmd("RPUSH")
            .arg(MAIN_QUEUE)
            .arg(json)
            .query_async::<()>(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))
    }

    /// Pop up to `n` entries from the main queue.
    pub async fn pop_batch(&self, n: usize) -> Result<Vec<QueuedUsage>, BudgetError> {
        let mut redis = self.redis.clone();
        let raw: Vec<String> = redis::cmd("LPOP")
            .arg(MAIN_QUEUE)
            .arg(n)
            .query_async(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))?;

        let mut batch = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str::<QueuedUsage>(&json) {
                Ok(entry) => batch.push(entry),
                Err(e) => {
                    // Unparseable entries can never reconcile; dead-letter
                    // them instead of poisoning the batch forever.
                    warn!(error = %e, "dropping unparseable usage entry to dead-letter");
                    let mut redis = self.redis.clone();
                    let _ = redis::cmd("RPUSH")
                        .arg(DEAD_QUEUE)
                        .arg(json)
                        .query_async::<()>(&mut redis)
                        .await;
                }
            }
        }
        Ok(batch)
    }

    /// Park a failed entry for retry after its backoff, or dead-letter it
    /// once `max_retries` is spent.
    pub async fn park(&self, mut entry: QueuedUsage, max_retries: u32) -> Result<(), BudgetError> {
        entry.attempts += 1;
        let mut redis = self.redis.clone();

        if entry.attempts > max_retries {
            warn!(
                request_id = %entry.record.request_id,
                attempts = entry.attempts,
                "usage record exhausted retries, dead-lettering"
            );
            let json = serde_json::to_string(&entry)?;
            return redis::cmd("RPUSH")
                .arg(DEAD_QUEUE)
                .arg(json)
                .query_async::<()>(&mut redis)
                .await
                .map_err(|e| BudgetError::Redis(e.to_string()));
        }

        let due = chrono::Utc::now().timestamp() as u64 + backoff_secs(entry.attempts);
        let json = serde_json::to_string(&entry)?;
        redis::cmd("RPUSH")
            .arg(format!("{RETRY_PREFIX}{due}"))
            .arg(json)
            .query_async::<()>(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))
    }

    /// Move every due retry list back onto the main queue.
    pub async fn promote_due_retries(&self) -> Result<usize, BudgetError> {
        let mut redis = self.redis.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{RETRY_PREFIX}*"))
            .query_async(&mut redis)
            .await
            .map_err(|e| BudgetError::Redis(e.to_string()))?;

        let now = chrono::Utc::now().timestamp() as u64;
        let mut promoted = 0usize;

        for key in keys {
            let due: u64 = match key.strip_prefix(RETRY_PREFIX).and_then(|s| s.parse().ok()) {
                Some(ts) => ts,
                None => continue,
            };
            if due > now {
                continue;
            }
            loop {
                let entry: Option<String> = redis::cmd("LPOP")
                    .arg(&key)
                    .query_async(&mut redis)
                    .await
                    .map_err(|e| BudgetError::Redis(e.to_string()))?;
                match entry {
                    Some(json) => {
                        redis::cmd("RPUSH")
                            .arg(MAIN_QUEUE)
                            .arg(json)
                            .query_async::<()>(&mut redis)
                            .await
                            .map_err(|e| BudgetError::Redis(e.to_string()))?;
                        promoted += 1;
                    }
                    None => break,
                }
            }
        }

        if promoted > 0 {
            debug!(promoted, "retry entries promoted to main queue");
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::ProviderType;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(5), 32);
        assert_eq!(backoff_secs(6), 60);
        assert_eq!(backoff_secs(100), 60);
    }

    #[test]
    fn queued_entry_round_trips() {
        let entry = QueuedUsage {
            record: UsageRecord {
                request_id: "r1".into(),
                timestamp: chrono::Utc::now(),
                model: "gpt-4".into(),
                provider: ProviderType::Openai,
                instance_id: "gpt-4/a".into(),
                route_slug: None,
                provider_model: "gpt-4".into(),
                key_id: None,
                key_type: "api".into(),
                user_id: None,
                actual_user_id: None,
                team_id: None,
                method: "POST".into(),
                path: "/v1/chat/completions".into(),
                status_code: 200,
                input_tokens: 1,
                output_tokens: 2,
                total_tokens: 3,
                cost: 0.001,
                estimated_cost: 0.002,
                latency_ms: 10,
                retries: 0,
            },
            attempts: 2,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueuedUsage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 2);
        assert_eq!(back.record.request_id, "r1");
    }
}
