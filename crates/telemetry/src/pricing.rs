//! The layered pricing catalog.
//!
//! Three maps behind one read-write lock: built-in defaults, config
//! overrides, and database overrides, with precedence db > config >
//! default and field-by-field merging. An alias map translates
//! user-facing names to the provider's canonical model name before any
//! lookup. A Redis mirror (`pllm:pricing:{model}`) serves zero-lock
//! reads on hot paths and is written back asynchronously.

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Which layer a resolved entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Default,
    ConfigOverride,
    DbOverride,
    Runtime,
}

/// A fully resolved pricing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    /// USD per input token.
    pub input_cost_per_token: f64,
    /// USD per output token.
    pub output_cost_per_token: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_family: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    pub source: PricingSource,
}

impl PricingEntry {
    fn per_million(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_token: input / 1_000_000.0,
            output_cost_per_token: output / 1_000_000.0,
            max_tokens: None,
            max_input: None,
            max_output: None,
            provider_family: None,
            modalities: Vec::new(),
            capabilities: Vec::new(),
            source: PricingSource::Default,
        }
    }
}

/// A partial entry from an override layer; missing fields fall through
/// to the layer below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingOverride {
    #[serde(default)]
    pub input_cost_per_token: Option<f64>,
    #[serde(default)]
    pub output_cost_per_token: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_input: Option<u32>,
    #[serde(default)]
    pub max_output: Option<u32>,
    #[serde(default)]
    pub provider_family: Option<String>,
    #[serde(default)]
    pub modalities: Option<Vec<String>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl PricingOverride {
    fn apply(&self, base: Option<&PricingEntry>, source: PricingSource) -> PricingEntry {
        let mut entry = base.cloned().unwrap_or_else(|| PricingEntry {
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_tokens: None,
            max_input: None,
            max_output: None,
            provider_family: None,
            modalities: Vec::new(),
            capabilities: Vec::new(),
            source,
        });
        if let Some(v) = self.input_cost_per_token {
            entry.input_cost_per_token = v;
        }
        if let Some(v) = self.output_cost_per_token {
            entry.output_cost_per_token = v;
        }
        if let Some(v) = self.max_tokens {
            entry.max_tokens = Some(v);
        }
        if let Some(v) = self.max_input {
            entry.max_input = Some(v);
        }
        if let Some(v) = self.max_output {
            entry.max_output = Some(v);
        }
        if let Some(v) = &self.provider_family {
            entry.provider_family = Some(v.clone());
        }
        if let Some(v) = &self.modalities {
            entry.modalities = v.clone();
        }
        if let Some(v) = &self.capabilities {
            entry.capabilities = v.clone();
        }
        entry.source = source;
        entry
    }
}

/// Cost breakdown for one call.
#[derive(Debug, Clone, Serialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total: f64,
    pub source: PricingSource,
}

struct Layers {
    defaults: HashMap<String, PricingEntry>,
    config_overrides: HashMap<String, PricingOverride>,
    db_overrides: HashMap<String, PricingOverride>,
    /// user-facing name → provider canonical name
    aliases: HashMap<String, String>,
}

/// The catalog. Shared behind `Arc`; reads take the lock briefly.
pub struct PricingCatalog {
    layers: RwLock<Layers>,
}

impl PricingCatalog {
    /// Catalog seeded with the built-in default price sheet.
    pub fn with_defaults() -> Self {
        let mut defaults = HashMap::new();

        // Prices in USD per million tokens.
        defaults.insert("gpt-4".into(), PricingEntry::per_million(30.0, 60.0));
        defaults.insert("gpt-4-turbo".into(), PricingEntry::per_million(10.0, 30.0));
        defaults.insert("gpt-4o".into(), PricingEntry::per_million(2.5, 10.0));
        defaults.insert("gpt-4o-mini".into(), PricingEntry::per_million(0.15, 0.6));
        defaults.insert("gpt-3.5-turbo".into(), PricingEntry::per_million(0.5, 1.5));
        defaults.insert("o1".into(), PricingEntry::per_million(15.0, 60.0));
        defaults.insert("o3-mini".into(), PricingEntry::per_million(1.1, 4.4));
        defaults.insert("text-embedding-3-small".into(), PricingEntry::per_million(0.02, 0.0));
        defaults.insert("text-embedding-3-large".into(), PricingEntry::per_million(0.13, 0.0));

        defaults.insert("claude-opus-4".into(), PricingEntry::per_million(15.0, 75.0));
        defaults.insert("claude-sonnet-4".into(), PricingEntry::per_million(3.0, 15.0));
        defaults.insert("claude-3-5-sonnet".into(), PricingEntry::per_million(3.0, 15.0));
        defaults.insert("claude-3-5-haiku".into(), PricingEntry::per_million(0.8, 4.0));
        defaults.insert("claude-3-haiku".into(), PricingEntry::per_million(0.25, 1.25));

        defaults.insert("gemini-2.0-flash".into(), PricingEntry::per_million(0.1, 0.4));
        defaults.insert("gemini-1.5-pro".into(), PricingEntry::per_million(1.25, 5.0));
        defaults.insert("gemini-1.5-flash".into(), PricingEntry::per_million(0.075, 0.3));

        Self {
            layers: RwLock::new(Layers {
                defaults,
                config_overrides: HashMap::new(),
                db_overrides: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    pub fn empty() -> Self {
        Self {
            layers: RwLock::new(Layers {
                defaults: HashMap::new(),
                config_overrides: HashMap::new(),
                db_overrides: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Resolve an entry: alias first, then db > config > default with
    /// missing override fields filled from the default.
    pub fn get(&self, model: &str) -> Option<PricingEntry> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        let canonical = layers.aliases.get(model).map(String::as_str).unwrap_or(model);

        let base = layers.defaults.get(canonical);
        if let Some(db) = layers.db_overrides.get(canonical) {
            return Some(db.apply(base, PricingSource::DbOverride));
        }
        if let Some(config) = layers.config_overrides.get(canonical) {
            return Some(config.apply(base, PricingSource::ConfigOverride));
        }
        base.cloned()
    }

    /// Team-scoped lookup hook. Per-team price sheets resolve to the
    /// shared catalog today.
    pub fn get_for_team(&self, model: &str, _team_id: Option<&str>) -> Option<PricingEntry> {
        self.get(model)
    }

    /// Cost of a call. `None` when the model has no pricing entry.
    pub fn calculate_cost(
        &self,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Option<CostBreakdown> {
        let entry = self.get(model)?;
        let input_cost = input_tokens as f64 * entry.input_cost_per_token;
        let output_cost = output_tokens as f64 * entry.output_cost_per_token;
        Some(CostBreakdown {
            input_cost,
            output_cost,
            total: input_cost + output_cost,
            source: entry.source,
        })
    }

    /// Per-token rates for admission estimation.
    pub fn rates(&self, model: &str) -> Option<(f64, f64)> {
        self.get(model)
            .map(|e| (e.input_cost_per_token, e.output_cost_per_token))
    }

    pub fn set_alias(&self, user_facing: impl Into<String>, canonical: impl Into<String>) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.aliases.insert(user_facing.into(), canonical.into());
    }

    /// Replace the config override layer wholesale (config reload).
    pub fn reload_config_overrides(&self, overrides: HashMap<String, PricingOverride>) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.config_overrides = overrides;
        debug!(count = layers.config_overrides.len(), "config pricing overrides reloaded");
    }

    /// Replace the database override layer wholesale (admin mutation).
    pub fn reload_db_overrides(&self, overrides: HashMap<String, PricingOverride>) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.db_overrides = overrides;
        debug!(count = layers.db_overrides.len(), "db pricing overrides reloaded");
    }

    /// Runtime one-off entry (admin API).
    pub fn set_runtime(&self, model: impl Into<String>, input: f64, output: f64) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.db_overrides.insert(
            model.into(),
            PricingOverride {
                input_cost_per_token: Some(input),
                output_cost_per_token: Some(output),
                ..Default::default()
            },
        );
    }

    pub fn models(&self) -> Vec<String> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = layers
            .defaults
            .keys()
            .chain(layers.config_overrides.keys())
            .chain(layers.db_overrides.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Redis mirror for zero-lock pricing reads on hot paths.
///
/// Misses consult the in-process catalog synchronously and write the
/// entry back asynchronously.
#[derive(Clone)]
pub struct PricingMirror {
    redis: ConnectionManager,
    catalog: Arc<PricingCatalog>,
}

impl PricingMirror {
    pub fn new(redis: ConnectionManager, catalog: Arc<PricingCatalog>) -> Self {
        Self { redis, catalog }
    }

    fn key(model: &str) -> String {
        format!("pllm:pricing:{model}")
    }

    pub async fn get(&self, model: &str) -> Option<PricingEntry> {
        let mut redis = self.redis.clone();
        let cached: Option<String> = redis::cmd("GET")
            .arg(Self::key(model))
            .query_async(&mut redis)
            .await
            .unwrap_or(None);

        if let Some(json) = cached {
            if let Ok(entry) = serde_json::from_str(&json) {
                return Some(entry);
            }
        }

        let entry = self.catalog.get(model)?;
        // Write-behind: never block the request on the mirror.
        let mirror = self.clone();
        let model = model.to_string();
        let to_cache = entry.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.write_back(&model, &to_cache).await {
                warn!(model = %model, error = %e, "pricing mirror write-back failed");
            }
        });
        Some(entry)
    }

    async fn write_back(&self, model: &str, entry: &PricingEntry) -> Result<(), redis::RedisError> {
        let mut redis = self.redis.clone();
        let json = serde_json::to_string(entry).expect("pricing entry serializes");
        redis::pipe()
            .cmd("SET")
            .arg(Self::key(model))
            .arg(json)
            .ignore()
            .cmd("SET")
            .arg("pllm:pricing:_loaded")
            .arg("1")
            .ignore()
            .query_async::<()>(&mut redis)
            .await
    }
}
