//! Token-bucket rate limiting.
//!
//! In-memory buckets with a per-bucket mutex and a background sweeper
//! purging buckets idle for over an hour. An optional Redis backend runs
//! the same debit as an atomic Lua script for multi-replica deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Buckets idle longer than this are purged by the sweeper.
const IDLE_PURGE: Duration = Duration::from_secs(3600);

struct Bucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate: capacity as f64 / window.as_secs_f64().max(0.001),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// In-memory token-bucket limiter.
pub struct RateLimiter {
    default_capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(default_capacity: u32, window: Duration) -> Self {
        Self { default_capacity, window, buckets: Mutex::new(HashMap::new()) }
    }

    fn bucket(&self, key: &str, capacity: u32) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(capacity, self.window))))
            .clone()
    }

    /// Debit one token. `limit` overrides the default capacity for this
    /// key's bucket (key-level rpm).
    pub fn allow(&self, key: &str, limit: Option<u32>) -> bool {
        self.allow_n(key, 1, limit)
    }

    /// Debit `n` tokens at once — stream requests pre-reserve output
    /// volume this way.
    pub fn allow_n(&self, key: &str, n: u32, limit: Option<u32>) -> bool {
        let capacity = limit.unwrap_or(self.default_capacity);
        let bucket = self.bucket(key, capacity);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.try_take(n as f64, Instant::now())
    }

    /// Drop buckets that have not refilled in over an hour.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket
                .lock()
                .map(|b| now.duration_since(b.last_refill) < IDLE_PURGE)
                .unwrap_or(false)
        });
        if buckets.len() < before {
            debug!(purged = before - buckets.len(), "rate limit buckets swept");
        }
    }

    /// Spawn the hourly sweeper.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => limiter.sweep(),
                    None => return,
                }
            }
        })
    }
}

/// Redis-backed limiter for multi-replica deployments.
///
/// The debit runs as one Lua script so concurrent replicas never
/// read-modify-write the same bucket.
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    script: redis::Script,
    default_capacity: u32,
    window: Duration,
}

impl RedisRateLimiter {
    pub fn new(redis: ConnectionManager, default_capacity: u32, window: Duration) -> Self {
        // KEYS[1] bucket hash; ARGV: capacity, refill_rate, now_ms, n
        let script = redis::Script::new(
            r#"
local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local tokens = tonumber(bucket[1]) or capacity
local ts = tonumber(bucket[2]) or now
tokens = math.min(capacity, tokens + (now - ts) / 1000.0 * rate)
local allowed = 0
if tokens >= n then
  tokens = tokens - n
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], 3600)
return allowed
"#,
        );
        Self { redis, script, default_capacity, window }
    }

    pub async fn allow_n(&self, key: &str, n: u32, limit: Option<u32>) -> bool {
        let capacity = limit.unwrap_or(self.default_capacity);
        let rate = capacity as f64 / self.window.as_secs_f64().max(0.001);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut redis = self.redis.clone();
        let result: Result<i64, _> = self
            .script
            .key(format!("ratelimit:{key}"))
            .arg(capacity)
            .arg(rate)
            .arg(now_ms)
            .arg(n)
            .invoke_async(&mut redis)
            .await;

        match result {
            Ok(allowed) => allowed == 1,
            Err(e) => {
                // Same fail-open stance as admission: infrastructure
                // trouble must not take down the data plane.
                warn!(error = %e, "redis rate limiter unavailable, failing open");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32) -> RateLimiter {
        RateLimiter::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn first_n_allowed_then_rejected() {
        let rl = limiter(3);
        assert!(rl.allow("k", None));
        assert!(rl.allow("k", None));
        assert!(rl.allow("k", None));
        assert!(!rl.allow("k", None));
    }

    #[test]
    fn buckets_are_per_key() {
        let rl = limiter(1);
        assert!(rl.allow("a", None));
        assert!(rl.allow("b", None));
        assert!(!rl.allow("a", None));
    }

    #[test]
    fn key_level_limit_overrides_default() {
        let rl = limiter(100);
        assert!(rl.allow_n("k", 1, Some(2)));
        assert!(rl.allow_n("k", 1, Some(2)));
        assert!(!rl.allow_n("k", 1, Some(2)));
    }

    #[test]
    fn allow_n_debits_in_bulk() {
        let rl = limiter(10);
        assert!(rl.allow_n("k", 8, None));
        assert!(!rl.allow_n("k", 8, None));
        assert!(rl.allow_n("k", 2, None));
    }

    #[test]
    fn refills_over_time() {
        // 60 capacity over a 60s window = 1 token/sec.
        let rl = RateLimiter::new(60, Duration::from_secs(60));
        let bucket = rl.bucket("k", 60);
        {
            let mut b = bucket.lock().unwrap();
            let start = Instant::now();
            assert!(b.try_take(60.0, start));
            assert!(!b.try_take(1.0, start));
            // After exactly one window the bucket is full again.
            assert!(b.try_take(60.0, start + Duration::from_secs(60)));
        }
    }

    #[test]
    fn refill_caps_at_capacity() {
        let rl = limiter(5);
        let bucket = rl.bucket("k", 5);
        let mut b = bucket.lock().unwrap();
        let start = Instant::now();
        assert!(b.try_take(1.0, start));
        // A very long idle period cannot overfill.
        b.refill(start + Duration::from_secs(100_000));
        assert!(b.tokens <= 5.0);
    }

    #[test]
    fn sweep_purges_only_idle_buckets() {
        let rl = limiter(5);
        rl.allow("fresh", None);
        {
            // Backdate a bucket to look idle.
            let bucket = rl.bucket("stale", 5);
            bucket.lock().unwrap().last_refill = Instant::now() - Duration::from_secs(7200);
        }
        rl.sweep();
        let buckets = rl.buckets.lock().unwrap();
        assert!(buckets.contains_key("fresh"));
        assert!(!buckets.contains_key("stale"));
    }
}
