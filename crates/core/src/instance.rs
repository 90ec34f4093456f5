//! Model instance descriptors.
//!
//! A [`ModelInstance`] is one addressable upstream endpoint: a
//! `(provider, credentials, upstream model name)` triple with routing
//! weight, priority, and per-minute limits. Many instances can serve the
//! same logical model name.

use serde::{Deserialize, Serialize};

/// Stable identifier for a registered instance.
pub type InstanceId = String;

/// The upstream provider family an instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Azure,
    Bedrock,
    Vertex,
    OpenaiCompatible,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Azure => "azure",
            Self::Bedrock => "bedrock",
            Self::Vertex => "vertex",
            Self::OpenaiCompatible => "openai-compatible",
        };
        write!(f, "{s}")
    }
}

/// Provider-specific connection parameters.
///
/// Only the fields relevant to the instance's [`ProviderType`] are set;
/// the rest stay `None`. Secrets here are already `${VAR}`-expanded by the
/// config loader.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_deployment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_project: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_location: Option<String>,

    /// Service-account JSON blob (client_email + private_key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_credentials: Option<String>,
}

impl std::fmt::Debug for ProviderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(s: &Option<String>) -> &'static str {
            match s {
                Some(_) => "[REDACTED]",
                None => "None",
            }
        }
        f.debug_struct("ProviderParams")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("org_id", &self.org_id)
            .field("azure_deployment", &self.azure_deployment)
            .field("aws_region", &self.aws_region)
            .field("aws_access_key_id", &redact(&self.aws_access_key_id))
            .field("aws_secret_access_key", &redact(&self.aws_secret_access_key))
            .field("vertex_project", &self.vertex_project)
            .field("vertex_location", &self.vertex_location)
            .field("vertex_credentials", &redact(&self.vertex_credentials))
            .finish()
    }
}

/// One addressable upstream endpoint serving a logical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstance {
    /// Unique across the registry.
    pub id: InstanceId,

    /// The model name clients request.
    pub logical_name: String,

    /// Distinguishes siblings serving the same logical model.
    /// `(logical_name, instance_name)` is unique.
    pub instance_name: String,

    pub provider: ProviderType,

    pub params: ProviderParams,

    /// The model name sent upstream (may differ from `logical_name`).
    pub upstream_model: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Higher wins under the priority strategy.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_token: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_token: Option<f64>,

    /// Per-instance upstream timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Disabled instances stay registered but are routing-invisible.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl ModelInstance {
    /// Derive the registry id from the unique `(logical, instance)` pair.
    pub fn derive_id(logical_name: &str, instance_name: &str) -> InstanceId {
        format!("{logical_name}/{instance_name}")
    }
}
