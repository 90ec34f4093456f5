//! `model_list` entries and their conversion to [`ModelInstance`].
//!
//! The YAML surface is user-friendly (flat params block, optional
//! everything); the internal representation is the registry's strongly
//! typed instance descriptor.

use pllm_core::instance::{ModelInstance, ProviderParams, ProviderType};
use serde::{Deserialize, Serialize};

/// One `model_list` entry as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListEntry {
    /// The logical name clients request.
    pub model_name: String,

    /// Distinguishes siblings of the same logical model. Defaults to the
    /// provider type when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    pub params: ModelParams,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_token: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_token: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// The `params` block of a `model_list` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Provider type: openai, anthropic, azure, bedrock, vertex,
    /// openai-compatible.
    #[serde(rename = "type")]
    pub provider: ProviderType,

    /// The model name sent upstream.
    pub model: String,

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

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_credentials: Option<String>,
}

impl ModelListEntry {
    pub fn effective_instance_name(&self) -> String {
        self.instance_name
            .clone()
            .unwrap_or_else(|| self.params.provider.to_string())
    }

    /// Convert into the registry's instance descriptor.
    pub fn to_instance(&self, default_timeout_secs: u64) -> ModelInstance {
        let instance_name = self.effective_instance_name();
        ModelInstance {
            id: ModelInstance::derive_id(&self.model_name, &instance_name),
            logical_name: self.model_name.clone(),
            instance_name,
            provider: self.params.provider,
            params: ProviderParams {
                api_key: self.params.api_key.clone(),
                base_url: self.params.base_url.clone(),
                api_version: self.params.api_version.clone(),
                org_id: self.params.org_id.clone(),
                azure_deployment: self.params.azure_deployment.clone(),
                aws_region: self.params.aws_region.clone(),
                aws_access_key_id: self.params.aws_access_key_id.clone(),
                aws_secret_access_key: self.params.aws_secret_access_key.clone(),
                vertex_project: self.params.vertex_project.clone(),
                vertex_location: self.params.vertex_location.clone(),
                vertex_credentials: self.params.vertex_credentials.clone(),
            },
            upstream_model: self.params.model.clone(),
            weight: self.weight.unwrap_or(1.0),
            priority: self.priority.unwrap_or(0),
            rpm_limit: self.rpm,
            tpm_limit: self.tpm,
            input_cost_per_token: self.input_cost_per_token,
            output_cost_per_token: self.output_cost_per_token,
            timeout_secs: self.timeout.unwrap_or(default_timeout_secs),
            tags: self.tags.clone(),
            enabled: self.enabled.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_converts_with_defaults() {
        let yaml = r#"
model_name: gpt-4
params:
  type: openai
  model: gpt-4-0613
  api_key: sk-test
rpm: 100
priority: 5
"#;
        let entry: ModelListEntry = serde_yaml::from_str(yaml).unwrap();
        let instance = entry.to_instance(60);
        assert_eq!(instance.id, "gpt-4/openai");
        assert_eq!(instance.logical_name, "gpt-4");
        assert_eq!(instance.upstream_model, "gpt-4-0613");
        assert_eq!(instance.rpm_limit, Some(100));
        assert_eq!(instance.priority, 5);
        assert_eq!(instance.timeout_secs, 60);
        assert!(instance.enabled);
        assert!((instance.weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn azure_entry_carries_deployment() {
        let yaml = r#"
model_name: gpt-4
instance_name: azure-eu
params:
  type: azure
  model: gpt-4
  api_key: az-key
  base_url: https://eu.openai.azure.com
  azure_deployment: gpt4-prod
  api_version: 2024-02-01
timeout: 120
"#;
        let entry: ModelListEntry = serde_yaml::from_str(yaml).unwrap();
        let instance = entry.to_instance(60);
        assert_eq!(instance.id, "gpt-4/azure-eu");
        assert_eq!(instance.provider, ProviderType::Azure);
        assert_eq!(instance.params.azure_deployment.as_deref(), Some("gpt4-prod"));
        assert_eq!(instance.timeout_secs, 120);
    }

    #[test]
    fn disabled_entry_stays_disabled() {
        let yaml = r#"
model_name: gpt-4
params: {type: openai, model: gpt-4}
enabled: false
"#;
        let entry: ModelListEntry = serde_yaml::from_str(yaml).unwrap();
        assert!(!entry.to_instance(60).enabled);
    }
}
