//! The model registry — instances grouped by logical model, with
//! runtime health and windowed counters.
//!
//! Read-mostly: one `RwLock` guards the maps, writers are config reload
//! and admin mutations only. Per-instance counters are atomics so the
//! hot path never takes the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use pllm_core::adapter::Adapter;
use pllm_core::instance::{InstanceId, ModelInstance};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Consecutive failures before an instance is marked unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

/// Width of the RPM/TPM accounting window.
const WINDOW: Duration = Duration::from_secs(60);

/// Runtime state for one instance. Not persisted.
pub struct InstanceState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    last_success_epoch: AtomicU64,
    last_failure_epoch: AtomicU64,
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
    /// EMA stored in microseconds; 0 means no samples yet.
    ema_latency_us: AtomicU64,
    rpm_window_start: AtomicU64,
    rpm_count: AtomicU32,
    tpm_count: AtomicU32,
    active_in_flight: AtomicU32,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            last_success_epoch: AtomicU64::new(0),
            last_failure_epoch: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            ema_latency_us: AtomicU64::new(0),
            rpm_window_start: AtomicU64::new(now_epoch()),
            rpm_count: AtomicU32::new(0),
            tpm_count: AtomicU32::new(0),
            active_in_flight: AtomicU32::new(0),
        }
    }
}

fn now_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// An instance plus its runtime state and bound adapter.
pub struct RegisteredInstance {
    pub spec: ModelInstance,
    pub adapter: Arc<dyn Adapter>,
    state: InstanceState,
}

impl RegisteredInstance {
    pub fn new(spec: ModelInstance, adapter: Arc<dyn Adapter>) -> Self {
        Self { spec, adapter, state: InstanceState::default() }
    }

    pub fn healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn active_in_flight(&self) -> u32 {
        self.state.active_in_flight.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.state.total_requests.load(Ordering::Acquire)
    }

    pub fn ema_latency_ms(&self) -> Option<f64> {
        match self.state.ema_latency_us.load(Ordering::Acquire) {
            0 => None,
            us => Some(us as f64 / 1000.0),
        }
    }

    /// Reset the per-minute window if it expired. CAS ensures exactly one
    /// caller performs the reset; losers observe the fresh window.
    fn maybe_roll_window(&self) {
        let now = now_epoch();
        let start = self.state.rpm_window_start.load(Ordering::Acquire);
        if now.saturating_sub(start) < WINDOW.as_secs() {
            return;
        }
        if self
            .state
            .rpm_window_start
            .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.rpm_count.store(0, Ordering::Release);
            self.state.tpm_count.store(0, Ordering::Release);
        }
    }

    /// Over either per-minute cap?
    pub fn is_rate_limited(&self) -> bool {
        self.maybe_roll_window();
        if let Some(rpm) = self.spec.rpm_limit {
            if self.state.rpm_count.load(Ordering::Acquire) >= rpm {
                return true;
            }
        }
        if let Some(tpm) = self.spec.tpm_limit {
            if self.state.tpm_count.load(Ordering::Acquire) >= tpm {
                return true;
            }
        }
        false
    }

    /// Remaining requests in this window, for the usage-based strategy.
    pub fn rpm_headroom(&self) -> u32 {
        self.maybe_roll_window();
        match self.spec.rpm_limit {
            Some(limit) => limit.saturating_sub(self.state.rpm_count.load(Ordering::Acquire)),
            None => u32::MAX,
        }
    }

    /// Called by the router at selection time.
    pub(crate) fn begin_request(&self) {
        self.maybe_roll_window();
        self.state.active_in_flight.fetch_add(1, Ordering::AcqRel);
        self.state.rpm_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        self.state.active_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a completed successful call with its actual token volume.
    pub fn record_request(&self, tokens: u32, latency: Duration) {
        self.maybe_roll_window();
        self.state.total_requests.fetch_add(1, Ordering::AcqRel);
        self.state.total_tokens.fetch_add(tokens as u64, Ordering::AcqRel);
        self.state.tpm_count.fetch_add(tokens, Ordering::AcqRel);

        // EMA with alpha 0.2; first sample seeds the average.
        let sample_us = latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.state.ema_latency_us.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |prev| {
                Some(if prev == 0 { sample_us } else { (sample_us + 4 * prev) / 5 })
            },
        );

        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.healthy.store(true, Ordering::Release);
        self.state.last_success_epoch.store(now_epoch(), Ordering::Release);
    }

    /// Record a failed call. Marks unhealthy after a run of failures.
    pub fn record_error(&self, error: &str) {
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.last_failure_epoch.store(now_epoch(), Ordering::Release);
        *self.state.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(error.to_string());

        if failures >= UNHEALTHY_AFTER && self.state.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                instance = %self.spec.id,
                failures,
                error,
                "instance marked unhealthy"
            );
        }
    }

    fn revive_if_cooled(&self, cooldown: Duration) {
        if self.state.healthy.load(Ordering::Acquire) {
            return;
        }
        let last_failure = self.state.last_failure_epoch.load(Ordering::Acquire);
        if now_epoch().saturating_sub(last_failure) >= cooldown.as_secs() {
            self.state.healthy.store(true, Ordering::Release);
            self.state.consecutive_failures.store(0, Ordering::Release);
            info!(instance = %self.spec.id, "instance re-enabled after cooldown");
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.spec.id.clone(),
            logical_name: self.spec.logical_name.clone(),
            provider: self.spec.provider.to_string(),
            enabled: self.spec.enabled,
            healthy: self.healthy(),
            consecutive_failures: self.consecutive_failures(),
            last_error: self
                .state
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            total_requests: self.total_requests(),
            total_tokens: self.state.total_tokens.load(Ordering::Acquire),
            ema_latency_ms: self.ema_latency_ms(),
            active_in_flight: self.active_in_flight(),
            rpm_count: self.state.rpm_count.load(Ordering::Acquire),
            tpm_count: self.state.tpm_count.load(Ordering::Acquire),
        }
    }
}

/// Admin/health view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub logical_name: String,
    pub provider: String,
    pub enabled: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub ema_latency_ms: Option<f64>,
    pub active_in_flight: u32,
    pub rpm_count: u32,
    pub tpm_count: u32,
}

struct Inner {
    instances: HashMap<InstanceId, Arc<RegisteredInstance>>,
    /// Per logical model, sorted by descending priority (ties by id).
    by_model: HashMap<String, Vec<Arc<RegisteredInstance>>>,
}

/// The registry. Cheap to clone via `Arc` at construction sites.
pub struct ModelRegistry {
    inner: RwLock<Inner>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { instances: HashMap::new(), by_model: HashMap::new() }),
        }
    }

    /// Insert or replace an instance. Replacement resets runtime state.
    pub fn upsert(&self, spec: ModelInstance, adapter: Arc<dyn Adapter>) {
        let registered = Arc::new(RegisteredInstance::new(spec, adapter));
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let id = registered.spec.id.clone();
        let model = registered.spec.logical_name.clone();
        inner.instances.insert(id.clone(), registered.clone());

        let group = inner.by_model.entry(model).or_default();
        group.retain(|existing| existing.spec.id != id);
        group.push(registered);
        group.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then_with(|| a.spec.id.cmp(&b.spec.id))
        });

        debug!(instance = %id, "instance registered");
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(removed) = inner.instances.remove(id) else {
            return false;
        };
        if let Some(group) = inner.by_model.get_mut(&removed.spec.logical_name) {
            group.retain(|i| i.spec.id != id);
            if group.is_empty() {
                inner.by_model.remove(&removed.spec.logical_name);
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegisteredInstance>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .instances
            .get(id)
            .cloned()
    }

    /// Enabled instances for a logical model, priority order. `None` when
    /// the model is unknown (distinct from known-but-all-disabled).
    pub fn instances_for(&self, model: &str) -> Option<Vec<Arc<RegisteredInstance>>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_model.get(model).map(|group| {
            group.iter().filter(|i| i.spec.enabled).cloned().collect()
        })
    }

    /// All logical model names with at least one registered instance.
    pub fn logical_models(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut models: Vec<String> = inner.by_model.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut snaps: Vec<InstanceSnapshot> =
            inner.instances.values().map(|i| i.snapshot()).collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        snaps
    }

    /// One sweep: roll expired windows and revive cooled-down instances.
    pub fn sweep(&self, cooldown: Duration) {
        let instances: Vec<Arc<RegisteredInstance>> = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner.instances.values().cloned().collect()
        };
        for instance in instances {
            instance.maybe_roll_window();
            instance.revive_if_cooled(cooldown);
        }
    }

    /// Spawn the background sweeper. Runs until the registry is dropped
    /// by every holder.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cooldown: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => registry.sweep(cooldown),
                    None => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pllm_core::error::AdapterError;
    use pllm_core::instance::ProviderType;
    use pllm_core::openai::{ChatCompletionRequest, ChatCompletionResponse};

    struct NullAdapter;

    #[async_trait]
    impl Adapter for NullAdapter {
        fn provider_name(&self) -> &str {
            "null"
        }
        async fn chat_completion(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, AdapterError> {
            Err(AdapterError::Network("null".into()))
        }
        async fn chat_completion_stream(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<pllm_core::adapter::ChunkReceiver, AdapterError> {
            Err(AdapterError::Network("null".into()))
        }
    }

    fn spec(model: &str, name: &str, priority: i32) -> ModelInstance {
        ModelInstance {
            id: ModelInstance::derive_id(model, name),
            logical_name: model.into(),
            instance_name: name.into(),
            provider: ProviderType::Openai,
            params: Default::default(),
            upstream_model: model.into(),
            weight: 1.0,
            priority,
            rpm_limit: Some(2),
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            timeout_secs: 60,
            tags: vec![],
            enabled: true,
        }
    }

    fn registry_with(specs: Vec<ModelInstance>) -> ModelRegistry {
        let registry = ModelRegistry::new();
        for s in specs {
            registry.upsert(s, Arc::new(NullAdapter));
        }
        registry
    }

    #[test]
    fn groups_sorted_by_descending_priority() {
        let registry =
            registry_with(vec![spec("gpt-4", "low", 1), spec("gpt-4", "high", 9), spec("gpt-4", "mid", 5)]);
        let group = registry.instances_for("gpt-4").unwrap();
        let names: Vec<&str> = group.iter().map(|i| i.spec.instance_name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[test]
    fn unknown_model_is_none_not_empty() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        assert!(registry.instances_for("nope").is_none());
    }

    #[test]
    fn disabled_instances_invisible_but_present() {
        let mut disabled = spec("gpt-4", "b", 0);
        disabled.enabled = false;
        let registry = registry_with(vec![spec("gpt-4", "a", 0), disabled]);
        assert_eq!(registry.instances_for("gpt-4").unwrap().len(), 1);
        assert!(registry.get("gpt-4/b").is_some());
    }

    #[test]
    fn unhealthy_after_three_consecutive_failures() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        let instance = registry.get("gpt-4/a").unwrap();
        instance.record_error("boom");
        instance.record_error("boom");
        assert!(instance.healthy());
        instance.record_error("boom");
        assert!(!instance.healthy());
        assert_eq!(instance.consecutive_failures(), 3);
        assert_eq!(instance.snapshot().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn success_restores_health() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        let instance = registry.get("gpt-4/a").unwrap();
        for _ in 0..3 {
            instance.record_error("boom");
        }
        assert!(!instance.healthy());
        instance.record_request(10, Duration::from_millis(100));
        assert!(instance.healthy());
        assert_eq!(instance.consecutive_failures(), 0);
    }

    #[test]
    fn rpm_cap_hits_after_limit_selections() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        let instance = registry.get("gpt-4/a").unwrap();
        assert!(!instance.is_rate_limited());
        instance.begin_request();
        instance.begin_request();
        assert!(instance.is_rate_limited());
        assert_eq!(instance.rpm_headroom(), 0);
    }

    #[test]
    fn ema_seeds_then_smooths() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        let instance = registry.get("gpt-4/a").unwrap();
        assert!(instance.ema_latency_ms().is_none());
        instance.record_request(1, Duration::from_millis(100));
        assert!((instance.ema_latency_ms().unwrap() - 100.0).abs() < 1.0);
        instance.record_request(1, Duration::from_millis(200));
        let ema = instance.ema_latency_ms().unwrap();
        assert!(ema > 100.0 && ema < 200.0, "ema was {ema}");
    }

    #[test]
    fn sweep_revives_after_cooldown() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        let instance = registry.get("gpt-4/a").unwrap();
        for _ in 0..3 {
            instance.record_error("down");
        }
        assert!(!instance.healthy());
        // Zero cooldown: sweep revives immediately.
        registry.sweep(Duration::from_secs(0));
        assert!(instance.healthy());
    }

    #[test]
    fn upsert_replaces_and_removes_cleanly() {
        let registry = registry_with(vec![spec("gpt-4", "a", 0)]);
        registry.upsert(spec("gpt-4", "a", 7), Arc::new(NullAdapter));
        let group = registry.instances_for("gpt-4").unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].spec.priority, 7);

        assert!(registry.remove("gpt-4/a"));
        assert!(!registry.remove("gpt-4/a"));
        assert!(registry.instances_for("gpt-4").is_none());
    }
}
