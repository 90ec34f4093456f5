//! The rollup worker.
//!
//! A consumer group drains `usage_events` and folds each event into
//! rolling buckets keyed `(hour|day) × (model | system | user | team)`.
//! Buckets are upserted into the aggregate tables on every drain cycle,
//! so a crash loses at most one unacked batch — which the group
//! redelivers anyway.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use pllm_core::usage::RequestEvent;
use pllm_storage::{MetricsRow, MetricsTable, PgStore};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::events::STREAM_KEY;

const GROUP: &str = "pllm-rollup";

/// In-progress aggregate for one bucket.
#[derive(Debug, Default, Clone)]
struct Bucket {
    request_count: i64,
    success_count: i64,
    input_tokens: i64,
    output_tokens: i64,
    cost: f64,
    cache_hits: i64,
    latencies_ms: Vec<u64>,
}

impl Bucket {
    fn fold(&mut self, event: &RequestEvent) {
        self.request_count += 1;
        if event.success {
            self.success_count += 1;
        }
        if event.cache_hit {
            self.cache_hits += 1;
        }
        self.input_tokens += event.input_tokens as i64;
        self.output_tokens += event.output_tokens as i64;
        self.cost += event.cost;
        self.latencies_ms.push(event.latency_ms);
    }

    fn percentile(&self, sorted: &[u64], p: f64) -> i64 {
        if sorted.is_empty() {
            return 0;
        }
        let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[rank.min(sorted.len() - 1)] as i64
    }

    fn into_row(mut self, interval: &str, bucket_start: DateTime<Utc>, dimension: String) -> MetricsRow {
        self.latencies_ms.sort_unstable();
        let p50 = self.percentile(&self.latencies_ms, 0.50);
        let p95 = self.percentile(&self.latencies_ms, 0.95);
        let p99 = self.percentile(&self.latencies_ms, 0.99);

        let success_rate = if self.request_count > 0 {
            self.success_count as f64 / self.request_count as f64
        } else {
            0.0
        };
        // Success rate weighted by latency: a p95 at the 10s mark halves
        // the score.
        let latency_weight = 10_000.0 / (10_000.0 + p95 as f64);
        let health_score = (success_rate * latency_weight * 100.0).clamp(0.0, 100.0);

        let cache_hit_rate = if self.request_count > 0 {
            self.cache_hits as f64 / self.request_count as f64
        } else {
            0.0
        };

        MetricsRow {
            interval: interval.to_string(),
            bucket_start: Some(bucket_start),
            dimension,
            request_count: self.request_count,
            success_count: self.success_count,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost: self.cost,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            health_score,
            cache_hit_rate,
        }
    }
}

type BucketKey = (MetricsTable, &'static str, DateTime<Utc>, String);

/// Fold a batch of events into per-bucket aggregates.
fn fold_events(events: &[RequestEvent]) -> HashMap<BucketKey, Bucket> {
    let mut buckets: HashMap<BucketKey, Bucket> = HashMap::new();

    for event in events {
        let hour = event
            .timestamp
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(event.timestamp);
        let day = event
            .timestamp
            .duration_trunc(ChronoDuration::days(1))
            .unwrap_or(event.timestamp);

        let mut dimensions: Vec<(MetricsTable, String)> = vec![
            (MetricsTable::Model, event.model.clone()),
            (MetricsTable::System, "system".to_string()),
        ];
        if let Some(user_id) = &event.user_id {
            dimensions.push((MetricsTable::User, user_id.clone()));
        }
        if let Some(team_id) = &event.team_id {
            dimensions.push((MetricsTable::Team, team_id.clone()));
        }

        for (table, dimension) in dimensions {
            for (interval, bucket_start) in [("hourly", hour), ("daily", day)] {
                buckets
                    .entry((table, interval, bucket_start, dimension.clone()))
                    .or_default()
                    .fold(event);
            }
        }
    }

    buckets
}

/// Drains the event stream into the aggregate tables.
pub struct RollupWorker {
    redis: ConnectionManager,
    store: PgStore,
    consumer: String,
    block_ms: u64,
}

impl RollupWorker {
    pub fn new(redis: ConnectionManager, store: PgStore) -> Self {
        Self {
            redis,
            store,
            consumer: format!("rollup-{}", std::process::id()),
            block_ms: 5000,
        }
    }

    /// Create the consumer group if this is a fresh stream.
    async fn ensure_group(&self) {
        let mut redis = self.redis.clone();
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut redis)
            .await;
        // BUSYGROUP just means the group already exists.
        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                warn!(error = %e, "could not create rollup consumer group");
            }
        }
    }

    /// Run forever. Spawn next to the servers.
    pub async fn run(self) {
        self.ensure_group().await;
        info!(consumer = %self.consumer, "rollup worker started");
        loop {
            if let Err(e) = self.drain_once().await {
                error!(error = %e, "rollup drain failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    /// One XREADGROUP batch: parse, fold, upsert, ack.
    pub async fn drain_once(&self) -> Result<usize, redis::RedisError> {
        let mut redis = self.redis.clone();
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(256)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(STREAM_KEY)
            .arg(">")
            .query_async(&mut redis)
            .await?;

        let mut events = Vec::new();
        let mut ids = Vec::new();
        for stream in &reply.keys {
            for entry in &stream.ids {
                ids.push(entry.id.clone());
                let Some(redis::Value::BulkString(payload)) = entry.map.get("payload") else {
                    continue;
                };
                match serde_json::from_slice::<RequestEvent>(payload) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(error = %e, "skipping unparseable request event"),
                }
            }
        }

        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        let buckets = fold_events(&events);
        for ((table, interval, bucket_start, dimension), bucket) in buckets {
            let row = bucket.into_row(interval, bucket_start, dimension);
            if let Err(e) = self.store.upsert_metrics(table, &row).await {
                // Metrics are lossy-tolerant; log and move on.
                warn!(error = %e, "metrics upsert failed");
            }
        }

        let mut ack = redis::cmd("XACK");
        ack.arg(STREAM_KEY).arg(GROUP);
        for id in &ids {
            ack.arg(id);
        }
        ack.query_async::<()>(&mut redis).await?;

        debug!(events = count, "rollup batch folded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::ProviderType;

    fn event(model: &str, success: bool, latency: u64, user: Option<&str>) -> RequestEvent {
        RequestEvent {
            request_id: "r".into(),
            timestamp: Utc::now(),
            model: model.into(),
            provider: ProviderType::Openai,
            user_id: user.map(String::from),
            team_id: None,
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.001,
            latency_ms: latency,
            success,
            cache_hit: false,
            error_type: None,
        }
    }

    #[test]
    fn folds_model_and_system_dimensions() {
        let events = vec![event("gpt-4", true, 100, None), event("gpt-4", false, 200, None)];
        let buckets = fold_events(&events);

        // gpt-4 hourly + daily, system hourly + daily
        assert_eq!(buckets.len(), 4);
        let (_, bucket) = buckets
            .iter()
            .find(|((table, interval, _, dim), _)| {
                *table == MetricsTable::Model && *interval == "hourly" && dim == "gpt-4"
            })
            .unwrap();
        assert_eq!(bucket.request_count, 2);
        assert_eq!(bucket.success_count, 1);
        assert_eq!(bucket.input_tokens, 20);
    }

    #[test]
    fn user_dimension_only_when_present() {
        let events = vec![event("gpt-4", true, 100, Some("u1"))];
        let buckets = fold_events(&events);
        assert!(buckets.keys().any(|(table, _, _, dim)| *table == MetricsTable::User && dim == "u1"));
        assert_eq!(buckets.len(), 6);
    }

    #[test]
    fn percentiles_from_sorted_latencies() {
        let mut bucket = Bucket::default();
        for latency in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            bucket.fold(&event("m", true, latency, None));
        }
        let row = bucket.into_row("hourly", Utc::now(), "m".into());
        assert_eq!(row.p50_latency_ms, 50);
        assert_eq!(row.p99_latency_ms, 100);
        assert!(row.p95_latency_ms >= 90);
    }

    #[test]
    fn health_score_penalizes_failures_and_latency() {
        let mut healthy = Bucket::default();
        healthy.fold(&event("m", true, 50, None));
        let healthy_row = healthy.into_row("hourly", Utc::now(), "m".into());

        let mut failing = Bucket::default();
        failing.fold(&event("m", false, 50, None));
        let failing_row = failing.into_row("hourly", Utc::now(), "m".into());

        let mut slow = Bucket::default();
        slow.fold(&event("m", true, 30_000, None));
        let slow_row = slow.into_row("hourly", Utc::now(), "m".into());

        assert!(healthy_row.health_score > 95.0);
        assert_eq!(failing_row.health_score, 0.0);
        assert!(slow_row.health_score < 50.0);
    }
}
