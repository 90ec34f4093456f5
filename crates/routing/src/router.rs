//! The router — resolves a logical model to a concrete instance.
//!
//! Honors the configured strategy, instance health, per-minute windows,
//! the per-model circuit breaker, and fallback chains. Retries prefer a
//! different instance each attempt and only for retryable failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use pllm_core::error::{AdapterError, RouteError};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::registry::{ModelRegistry, RegisteredInstance};

/// Router knobs, distilled from the `router` config section.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub strategy: Strategy,
    pub max_retries: u32,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::Priority,
            max_retries: 3,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            fallbacks: HashMap::new(),
        }
    }
}

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Priority,
    RoundRobin,
    Weighted,
    LeastBusy,
    LatencyBased,
    UsageBased,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Self::Priority),
            "round-robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least-busy" => Ok(Self::LeastBusy),
            "latency-based" => Ok(Self::LatencyBased),
            "usage-based" => Ok(Self::UsageBased),
            other => Err(format!("unknown routing strategy '{other}'")),
        }
    }
}

/// A routed instance. Holds the in-flight slot until an outcome is
/// recorded; `resolved_model` may differ from the requested model when a
/// fallback served the request.
pub struct Selection {
    pub instance: Arc<RegisteredInstance>,
    pub resolved_model: String,
}

/// The router. One per process, shared behind `Arc`.
pub struct Router {
    registry: Arc<ModelRegistry>,
    settings: RouterSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    rr_counters: Mutex<HashMap<String, usize>>,
}

impl Router {
    pub fn new(registry: Arc<ModelRegistry>, settings: RouterSettings) -> Self {
        Self {
            registry,
            settings,
            breakers: RwLock::new(HashMap::new()),
            rr_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The breaker for a logical model, created on first use.
    pub fn breaker(&self, model: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().unwrap_or_else(|e| e.into_inner()).get(model) {
            return b.clone();
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.settings.circuit_breaker_threshold,
                    self.settings.circuit_breaker_cooldown,
                ))
            })
            .clone()
    }

    /// Resolve a logical model to an instance.
    pub fn pick_instance(&self, model: &str) -> Result<Selection, RouteError> {
        self.pick_excluding(model, &HashSet::new())
    }

    /// Same, but skipping instances already tried this request.
    pub fn pick_excluding(
        &self,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Result<Selection, RouteError> {
        let mut visited = HashSet::new();
        self.pick_inner(model, exclude, &mut visited)
    }

    fn pick_inner(
        &self,
        model: &str,
        exclude: &HashSet<String>,
        visited: &mut HashSet<String>,
    ) -> Result<Selection, RouteError> {
        // Loop detector: a model revisited along a fallback chain is a
        // configuration cycle, not an endless recursion.
        if !visited.insert(model.to_string()) {
            return Err(RouteError::NoHealthyInstance {
                model: model.to_string(),
                reason: "fallback cycle".into(),
            });
        }

        let breaker_open =
            self.settings.circuit_breaker_enabled && !self.breaker(model).can_request();

        if breaker_open {
            if let Some(chain) = self.settings.fallbacks.get(model).cloned() {
                for fallback in &chain {
                    debug!(model, fallback, "circuit open, trying fallback");
                    if let Ok(selection) = self.pick_inner(fallback, exclude, visited) {
                        info!(model, fallback, "request served via fallback model");
                        return Ok(selection);
                    }
                }
            }
            // Fallbacks exhausted: degraded mode against the original
            // model, rate-limit still respected.
            return self.pick_degraded(model, exclude);
        }

        let Some(candidates) = self.registry.instances_for(model) else {
            // Unknown model: fallbacks may still name a known one.
            if let Some(chain) = self.settings.fallbacks.get(model).cloned() {
                for fallback in &chain {
                    if let Ok(selection) = self.pick_inner(fallback, exclude, visited) {
                        return Ok(selection);
                    }
                }
            }
            return Err(RouteError::ModelNotFound(model.to_string()));
        };

        if candidates.is_empty() {
            return Err(RouteError::NoHealthyInstance {
                model: model.to_string(),
                reason: "all instances disabled".into(),
            });
        }

        let usable: Vec<Arc<RegisteredInstance>> = candidates
            .iter()
            .filter(|i| {
                !exclude.contains(&i.spec.id) && i.healthy() && !i.is_rate_limited()
            })
            .cloned()
            .collect();

        let chosen = if usable.is_empty() {
            // Degraded: ignore health, never rate limits.
            match candidates
                .iter()
                .find(|i| !exclude.contains(&i.spec.id) && !i.is_rate_limited())
            {
                Some(instance) => {
                    warn!(model, instance = %instance.spec.id, "degraded selection: no healthy instance");
                    instance.clone()
                }
                None => {
                    return Err(RouteError::NoHealthyInstance {
                        model: model.to_string(),
                        reason: "all instances rate-limited or excluded".into(),
                    });
                }
            }
        } else {
            self.select(model, &usable)
        };

        chosen.begin_request();
        Ok(Selection { instance: chosen, resolved_model: model.to_string() })
    }

    /// Degraded pick used when the model breaker is open and every
    /// fallback failed: first instance that is merely not rate-limited.
    fn pick_degraded(
        &self,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Result<Selection, RouteError> {
        let candidates = self
            .registry
            .instances_for(model)
            .ok_or_else(|| RouteError::ModelNotFound(model.to_string()))?;

        let instance = candidates
            .iter()
            .find(|i| !exclude.contains(&i.spec.id) && !i.is_rate_limited())
            .cloned()
            .ok_or_else(|| RouteError::NoHealthyInstance {
                model: model.to_string(),
                reason: "circuit open and fallbacks exhausted".into(),
            })?;

        warn!(model, instance = %instance.spec.id, "degraded selection: circuit open");
        instance.begin_request();
        Ok(Selection { instance, resolved_model: model.to_string() })
    }

    /// Apply the configured strategy to a non-empty candidate set that is
    /// already sorted by descending priority.
    fn select(
        &self,
        model: &str,
        usable: &[Arc<RegisteredInstance>],
    ) -> Arc<RegisteredInstance> {
        match self.settings.strategy {
            Strategy::Priority => usable[0].clone(),
            Strategy::RoundRobin => {
                let mut counters = self.rr_counters.lock().unwrap_or_else(|e| e.into_inner());
                let counter = counters.entry(model.to_string()).or_insert(0);
                let chosen = usable[*counter % usable.len()].clone();
                *counter = counter.wrapping_add(1);
                chosen
            }
            Strategy::Weighted => {
                let total: f64 = usable.iter().map(|i| i.spec.weight.max(0.0)).sum();
                if total <= 0.0 {
                    return usable[0].clone();
                }
                let mut draw = rand::rng().random_range(0.0..total);
                for instance in usable {
                    draw -= instance.spec.weight.max(0.0);
                    if draw < 0.0 {
                        return instance.clone();
                    }
                }
                usable[usable.len() - 1].clone()
            }
            Strategy::LeastBusy => usable
                .iter()
                .min_by_key(|i| (i.active_in_flight(), i.total_requests()))
                .cloned()
                .unwrap_or_else(|| usable[0].clone()),
            Strategy::LatencyBased => {
                let with_samples: Vec<&Arc<RegisteredInstance>> =
                    usable.iter().filter(|i| i.ema_latency_ms().is_some()).collect();
                if with_samples.is_empty() {
                    // No samples yet: fall back to priority order.
                    return usable[0].clone();
                }
                with_samples
                    .into_iter()
                    .min_by(|a, b| {
                        a.ema_latency_ms()
                            .partial_cmp(&b.ema_latency_ms())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
                    .unwrap_or_else(|| usable[0].clone())
            }
            Strategy::UsageBased => usable
                .iter()
                .max_by_key(|i| i.rpm_headroom())
                .cloned()
                .unwrap_or_else(|| usable[0].clone()),
        }
    }

    /// Record the outcome of a routed call. Releases the in-flight slot
    /// and updates instance health, window counters, and the breaker.
    pub fn record_outcome(
        &self,
        selection: &Selection,
        outcome: Result<u32, &AdapterError>,
        latency: Duration,
    ) {
        selection.instance.end_request();
        let breaker = self.breaker(&selection.resolved_model);

        match outcome {
            Ok(tokens) => {
                selection.instance.record_request(tokens, latency);
                breaker.record_success(latency);
            }
            Err(err) => {
                selection.instance.record_error(&err.to_string());
                match err {
                    AdapterError::Timeout(_) => breaker.record_timeout(),
                    AdapterError::Canceled => {} // client's choice, not an instance fault
                    _ => breaker.record_failure(),
                }
            }
        }
    }

    /// Drive an adapter call with retries.
    ///
    /// Up to `max_retries` additional attempts, each preferring an
    /// instance not yet tried; only retryable failures re-route. The
    /// terminal error is tagged with the originally requested model.
    pub async fn execute<T, F>(&self, model: &str, call: F) -> Result<(T, Selection, u32), RouteError>
    where
        F: for<'a> Fn(&'a Selection) -> BoxFuture<'a, Result<T, AdapterError>>,
    {
        let mut exclude: HashSet<String> = HashSet::new();
        let mut last_error: Option<AdapterError> = None;

        for attempt in 0..=self.settings.max_retries {
            let selection = match self.pick_excluding(model, &exclude) {
                Ok(s) => s,
                Err(route_err) => {
                    // Retries exhausted the pool; surface the upstream
                    // error if we have one, else the routing error.
                    return Err(match last_error {
                        Some(err) => RouteError::RetriesExhausted {
                            model: model.to_string(),
                            last_error: err,
                        },
                        None => route_err,
                    });
                }
            };

            let started = std::time::Instant::now();
            match call(&selection).await {
                Ok(value) => return Ok((value, selection, attempt)),
                Err(err) => {
                    let retryable = err.is_retryable();
                    self.record_outcome(&selection, Err(&err), started.elapsed());
                    warn!(
                        model,
                        instance = %selection.instance.spec.id,
                        attempt,
                        error = %err,
                        retryable,
                        "upstream attempt failed"
                    );
                    if !retryable {
                        return Err(RouteError::RetriesExhausted {
                            model: model.to_string(),
                            last_error: err,
                        });
                    }
                    exclude.insert(selection.instance.spec.id.clone());
                    last_error = Some(err);
                }
            }
        }

        Err(RouteError::RetriesExhausted {
            model: model.to_string(),
            last_error: last_error.unwrap_or(AdapterError::Network("no attempts made".into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pllm_core::adapter::{Adapter, ChunkReceiver};
    use pllm_core::instance::{ModelInstance, ProviderType};
    use pllm_core::openai::{
        ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAdapter {
        failures_before_success: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn failing(n: u32) -> Arc<Self> {
            Arc::new(Self { failures_before_success: AtomicU32::new(n), calls: AtomicU32::new(0) })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Adapter for ScriptedAdapter {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn chat_completion(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
                return Err(AdapterError::Upstream5xx { status: 500, message: "boom".into() });
            }
            Ok(ChatCompletionResponse {
                id: "ok".into(),
                object: "chat.completion".into(),
                created: 0,
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant("pong"),
                    finish_reason: Some("stop".into()),
                }],
                usage: Some(Usage { prompt_tokens: 2, completion_tokens: 1, total_tokens: 3 }),
            })
        }

        async fn chat_completion_stream(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<ChunkReceiver, AdapterError> {
            Err(AdapterError::Network("not used".into()))
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
            rpm_limit: None,
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            timeout_secs: 60,
            tags: vec![],
            enabled: true,
        }
    }

    fn router_with(
        instances: Vec<(ModelInstance, Arc<ScriptedAdapter>)>,
        settings: RouterSettings,
    ) -> Router {
        let registry = Arc::new(ModelRegistry::new());
        for (s, a) in instances {
            registry.upsert(s, a);
        }
        Router::new(registry, settings)
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.into(),
            messages: vec![ChatMessage::user("ping")],
            max_tokens: Some(5),
            temperature: None,
            top_p: None,
            stream: false,
            stop: None,
            tools: None,
            user: None,
        }
    }

    #[test]
    fn unknown_model_errors() {
        let router = router_with(vec![], RouterSettings::default());
        assert!(matches!(
            router.pick_instance("ghost"),
            Err(RouteError::ModelNotFound(_))
        ));
    }

    #[test]
    fn priority_strategy_picks_highest() {
        let router = router_with(
            vec![
                (spec("gpt-4", "low", 1), ScriptedAdapter::failing(0)),
                (spec("gpt-4", "high", 9), ScriptedAdapter::failing(0)),
            ],
            RouterSettings::default(),
        );
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.instance.spec.instance_name, "high");
        assert_eq!(selection.instance.active_in_flight(), 1);
    }

    #[test]
    fn round_robin_cycles() {
        let settings = RouterSettings { strategy: Strategy::RoundRobin, ..Default::default() };
        let router = router_with(
            vec![
                (spec("gpt-4", "a", 0), ScriptedAdapter::failing(0)),
                (spec("gpt-4", "b", 0), ScriptedAdapter::failing(0)),
            ],
            settings,
        );
        let mut seen = Vec::new();
        for _ in 0..4 {
            let s = router.pick_instance("gpt-4").unwrap();
            seen.push(s.instance.spec.instance_name.clone());
            s.instance.end_request();
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn least_busy_prefers_idle() {
        let settings = RouterSettings { strategy: Strategy::LeastBusy, ..Default::default() };
        let router = router_with(
            vec![
                (spec("gpt-4", "busy", 0), ScriptedAdapter::failing(0)),
                (spec("gpt-4", "idle", 0), ScriptedAdapter::failing(0)),
            ],
            settings,
        );
        // Occupy "busy" with an in-flight request.
        let first = router.pick_instance("gpt-4").unwrap();
        let second = router.pick_instance("gpt-4").unwrap();
        assert_ne!(first.instance.spec.id, second.instance.spec.id);
    }

    #[test]
    fn latency_based_falls_back_to_priority_without_samples() {
        let settings = RouterSettings { strategy: Strategy::LatencyBased, ..Default::default() };
        let router = router_with(
            vec![
                (spec("gpt-4", "slowish", 5), ScriptedAdapter::failing(0)),
                (spec("gpt-4", "other", 1), ScriptedAdapter::failing(0)),
            ],
            settings,
        );
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.instance.spec.instance_name, "slowish");
        selection.instance.end_request();

        // Seed latencies: "other" is faster.
        router.registry().get("gpt-4/slowish").unwrap().record_request(1, Duration::from_millis(900));
        router.registry().get("gpt-4/other").unwrap().record_request(1, Duration::from_millis(50));
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.instance.spec.instance_name, "other");
    }

    #[test]
    fn unhealthy_instances_excluded() {
        let router = router_with(
            vec![
                (spec("gpt-4", "sick", 9), ScriptedAdapter::failing(0)),
                (spec("gpt-4", "fine", 1), ScriptedAdapter::failing(0)),
            ],
            RouterSettings::default(),
        );
        let sick = router.registry().get("gpt-4/sick").unwrap();
        for _ in 0..3 {
            sick.record_error("down");
        }
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.instance.spec.instance_name, "fine");
    }

    #[test]
    fn degraded_mode_ignores_health_but_not_rate_limits() {
        let mut capped = spec("gpt-4", "only", 0);
        capped.rpm_limit = Some(1);
        let router = router_with(
            vec![(capped, ScriptedAdapter::failing(0))],
            RouterSettings::default(),
        );
        let only = router.registry().get("gpt-4/only").unwrap();
        for _ in 0..3 {
            only.record_error("down");
        }
        // Unhealthy but not rate-limited: degraded branch selects it.
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.instance.spec.instance_name, "only");

        // Now the window is exhausted too: nothing is selectable.
        assert!(router.pick_instance("gpt-4").is_err());
    }

    #[test]
    fn open_circuit_routes_to_fallback() {
        let mut settings = RouterSettings {
            circuit_breaker_threshold: 1,
            ..Default::default()
        };
        settings
            .fallbacks
            .insert("gpt-4".into(), vec!["gpt-4-turbo".into(), "gpt-3.5".into()]);
        let router = router_with(
            vec![
                (spec("gpt-4", "a", 0), ScriptedAdapter::failing(0)),
                (spec("gpt-4-turbo", "a", 0), ScriptedAdapter::failing(0)),
                (spec("gpt-3.5", "a", 0), ScriptedAdapter::failing(0)),
            ],
            settings,
        );
        router.breaker("gpt-4").record_failure();
        let selection = router.pick_instance("gpt-4").unwrap();
        assert_eq!(selection.resolved_model, "gpt-4-turbo");
    }

    #[test]
    fn fallback_cycle_terminates() {
        let mut settings = RouterSettings { circuit_breaker_threshold: 1, ..Default::default() };
        settings.fallbacks.insert("a".into(), vec!["b".into()]);
        settings.fallbacks.insert("b".into(), vec!["a".into()]);
        let router = router_with(
            vec![(spec("a", "x", 0), ScriptedAdapter::failing(0))],
            settings,
        );
        router.breaker("a").record_failure();
        router.breaker("b").record_failure();
        // Both circuits open, chains loop back: degraded pick on "a".
        let selection = router.pick_instance("a").unwrap();
        assert_eq!(selection.resolved_model, "a");
    }

    #[tokio::test]
    async fn execute_retries_on_different_instance() {
        let failing = ScriptedAdapter::failing(10);
        let good = ScriptedAdapter::failing(0);
        let router = router_with(
            vec![
                (spec("gpt-4", "bad", 9), failing.clone()),
                (spec("gpt-4", "good", 1), good.clone()),
            ],
            RouterSettings::default(),
        );

        let req = request("gpt-4");
        let (response, selection, attempts) = router
            .execute("gpt-4", |s| {
                let req = req.clone();
                let adapter = s.instance.adapter.clone();
                Box::pin(async move { adapter.chat_completion(&req).await })
            })
            .await
            .unwrap();

        assert_eq!(response.choices[0].message.content.as_deref(), Some("pong"));
        assert_eq!(selection.instance.spec.instance_name, "good");
        assert_eq!(attempts, 1);
        assert_eq!(failing.calls(), 1);
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn execute_does_not_retry_non_retryable() {
        let adapter = Arc::new(ScriptedAdapter {
            failures_before_success: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let router = router_with(
            vec![(spec("gpt-4", "a", 0), adapter.clone())],
            RouterSettings::default(),
        );

        let result: Result<((), Selection, u32), RouteError> = router
            .execute("gpt-4", |_s| {
                Box::pin(async {
                    Err(AdapterError::Upstream4xx { status: 400, message: "bad".into() })
                })
            })
            .await;

        match result {
            Err(RouteError::RetriesExhausted { last_error, .. }) => {
                assert!(matches!(last_error, AdapterError::Upstream4xx { .. }));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn failover_marks_instance_unhealthy_after_three_failures() {
        let failing = ScriptedAdapter::failing(100);
        let good = ScriptedAdapter::failing(0);
        let router = router_with(
            vec![
                (spec("gpt-4", "i1", 9), failing.clone()),
                (spec("gpt-4", "i2", 1), good.clone()),
            ],
            RouterSettings { max_retries: 5, ..Default::default() },
        );

        // Three requests; each first attempt hits i1 until it turns
        // unhealthy, then i2 serves directly.
        for _ in 0..3 {
            let req = request("gpt-4");
            let (_, selection, _) = router
                .execute("gpt-4", |s| {
                    let req = req.clone();
                    let adapter = s.instance.adapter.clone();
                    Box::pin(async move { adapter.chat_completion(&req).await })
                })
                .await
                .unwrap();
            router.record_outcome(&selection, Ok(3), Duration::from_millis(20));
        }

        let i1 = router.registry().get("gpt-4/i1").unwrap();
        assert!(!i1.healthy());
        assert_eq!(i1.consecutive_failures(), 3);

        // Subsequent request goes straight to i2.
        let req = request("gpt-4");
        let (_, selection, attempts) = router
            .execute("gpt-4", |s| {
                let req = req.clone();
                let adapter = s.instance.adapter.clone();
                Box::pin(async move { adapter.chat_completion(&req).await })
            })
            .await
            .unwrap();
        assert_eq!(selection.instance.spec.instance_name, "i2");
        assert_eq!(attempts, 0);
    }
}
