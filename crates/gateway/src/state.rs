//! The `CoreServices` bundle.
//!
//! Every shared handle the request plane needs, made explicit and passed
//! to constructors — no hidden globals. The Redis-backed services are
//! optional: without Redis the gateway degrades to fail-open admission
//! and lossy accounting, which is the documented dev-mode behavior.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pllm_auth::Authenticator;
use pllm_budget::{BudgetCache, UsageQueue};
use pllm_config::Config;
use pllm_core::instance::ProviderType;
use pllm_routing::{ModelRegistry, Router};
use pllm_storage::PgStore;
use pllm_telemetry::{EventEmitter, GatewayMetrics, PricingCatalog, PricingMirror};
use tokio::sync::Semaphore;

use crate::ratelimit::RateLimiter;

/// Upstream concurrency cap per provider family.
const PER_PROVIDER_CONCURRENCY: usize = 256;

/// Shared application state for the gateway.
pub struct CoreServices {
    pub config: Config,
    pub registry: Arc<ModelRegistry>,
    pub router: Arc<Router>,
    pub authenticator: Authenticator<PgStore>,
    pub store: PgStore,
    pub pricing: Arc<PricingCatalog>,
    pub metrics: Arc<GatewayMetrics>,
    pub rate_limiter: Arc<RateLimiter>,

    /// `None` when Redis is not configured (dev mode): admission fails
    /// open, usage and events are dropped with a log line.
    pub budget: Option<BudgetCache>,
    pub usage_queue: Option<UsageQueue>,
    pub events: Option<EventEmitter>,
    pub redis: Option<redis::aio::ConnectionManager>,
    /// Zero-lock pricing reads on the hot path when Redis is present.
    pub pricing_mirror: Option<PricingMirror>,

    /// Global semaphores bounding concurrent upstream calls per provider.
    provider_semaphores: HashMap<ProviderType, Arc<Semaphore>>,

    /// In-flight request count per key, for `max_parallel`.
    key_in_flight: Mutex<HashMap<String, u32>>,
}

pub type SharedState = Arc<CoreServices>;

impl CoreServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<ModelRegistry>,
        router: Arc<Router>,
        authenticator: Authenticator<PgStore>,
        store: PgStore,
        pricing: Arc<PricingCatalog>,
        budget: Option<BudgetCache>,
        usage_queue: Option<UsageQueue>,
        events: Option<EventEmitter>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        let pricing_mirror = match (&redis, config.cache.pricing_mirror) {
            (Some(redis), true) => Some(PricingMirror::new(redis.clone(), pricing.clone())),
            _ => None,
        };
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.default_rpm,
            std::time::Duration::from_secs(config.rate_limit.window_secs),
        ));

        let provider_semaphores = [
            ProviderType::Openai,
            ProviderType::Anthropic,
            ProviderType::Azure,
            ProviderType::Bedrock,
            ProviderType::Vertex,
            ProviderType::OpenaiCompatible,
        ]
        .into_iter()
        .map(|p| (p, Arc::new(Semaphore::new(PER_PROVIDER_CONCURRENCY))))
        .collect();

        Self {
            config,
            registry,
            router,
            authenticator,
            store,
            pricing,
            metrics: Arc::new(GatewayMetrics::new()),
            rate_limiter,
            budget,
            usage_queue,
            events,
            redis,
            pricing_mirror,
            provider_semaphores,
            key_in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_semaphore(&self, provider: ProviderType) -> Arc<Semaphore> {
        self.provider_semaphores
            .get(&provider)
            .cloned()
            .expect("all provider types have a semaphore")
    }

    /// Claim an in-flight slot for a key. Returns false once
    /// `max_parallel` is reached.
    pub fn try_begin_key_request(&self, key_id: &str, max_parallel: u32) -> bool {
        let mut map = self.key_in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let count = map.entry(key_id.to_string()).or_insert(0);
        if *count >= max_parallel {
            return false;
        }
        *count += 1;
        true
    }

    pub fn end_key_request(&self, key_id: &str) {
        let mut map = self.key_in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = map.get_mut(key_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(key_id);
            }
        }
    }
}
