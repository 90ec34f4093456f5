//! Azure OpenAI adapter.
//!
//! Same wire dialect as OpenAI but addressed by deployment:
//! `{base}/openai/deployments/{deployment}/...?api-version={v}` with an
//! `api-key` header instead of a Bearer token. The model field in the
//! body is ignored by Azure (the deployment decides), but we still send
//! the upstream name for log symmetry.

use async_trait::async_trait;
use pllm_core::adapter::{Adapter, ChunkReceiver};
use pllm_core::error::AdapterError;
use pllm_core::instance::ModelInstance;
use pllm_core::openai::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::openai::spawn_chunk_forwarder;
use crate::{retry_after_secs, status_error, transport_error};

const DEFAULT_API_VERSION: &str = "2024-02-01";

/// An Azure OpenAI deployment.
pub struct AzureAdapter {
    base_url: String,
    api_key: String,
    deployment: String,
    api_version: String,
    upstream_model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl AzureAdapter {
    pub fn from_instance(instance: &ModelInstance) -> Self {
        Self {
            base_url: instance
                .params
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: instance.params.api_key.clone().unwrap_or_default(),
            deployment: instance
                .params
                .azure_deployment
                .clone()
                .unwrap_or_else(|| instance.upstream_model.clone()),
            api_version: instance
                .params
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.into()),
            upstream_model: instance.upstream_model.clone(),
            timeout_secs: instance.timeout_secs,
            client: crate::http_client(),
        }
    }

    fn url(&self, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.base_url, self.deployment, operation, self.api_version
        )
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AdapterError> {
        let mut builder = self
            .client
            .post(url)
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json");
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.timeout_secs));
        }

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }
        let retry_after = retry_after_secs(response.headers());
        let text = response.text().await.unwrap_or_default();
        warn!(provider = "azure", status, deployment = %self.deployment, "upstream returned error");
        Err(status_error(status, text, retry_after))
    }
}

#[async_trait]
impl Adapter for AzureAdapter {
    fn provider_name(&self) -> &str {
        "azure"
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, AdapterError> {
        let mut req = request.clone();
        req.model = self.upstream_model.clone();
        req.stream = false;

        debug!(provider = "azure", deployment = %self.deployment, "sending chat completion");

        let body = serde_json::to_value(&req).map_err(|e| AdapterError::Malformed(e.to_string()))?;
        let response = self.post(&self.url("chat/completions"), &body, false).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("chat completion decode: {e}")))
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, AdapterError> {
        let mut body = serde_json::to_value(request.clone())
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        body["model"] = serde_json::json!(self.upstream_model);
        body["stream"] = serde_json::json!(true);

        debug!(provider = "azure", deployment = %self.deployment, "sending streaming chat completion");

        let response = self.post(&self.url("chat/completions"), &body, true).await?;
        Ok(spawn_chunk_forwarder("azure".into(), response))
    }

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, AdapterError> {
        let mut req = request.clone();
        req.model = self.upstream_model.clone();

        let body = serde_json::to_value(&req).map_err(|e| AdapterError::Malformed(e.to_string()))?;
        let response = self.post(&self.url("embeddings"), &body, false).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("embedding decode: {e}")))
    }

    async fn health(&self) -> std::result::Result<(), AdapterError> {
        // Listing deployments needs a management-plane token; data-plane
        // reachability is probed against the account root instead.
        let response = self
            .client
            .get(&self.base_url)
            .header("api-key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| transport_error(e, 10))?;
        let status = response.status().as_u16();
        if status >= 500 {
            return Err(AdapterError::Upstream5xx { status, message: "health probe".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::{ProviderParams, ProviderType};

    fn instance(deployment: Option<&str>, api_version: Option<&str>) -> ModelInstance {
        ModelInstance {
            id: "gpt-4/azure".into(),
            logical_name: "gpt-4".into(),
            instance_name: "azure".into(),
            provider: ProviderType::Azure,
            params: ProviderParams {
                api_key: Some("az-key".into()),
                base_url: Some("https://acct.openai.azure.com/".into()),
                azure_deployment: deployment.map(String::from),
                api_version: api_version.map(String::from),
                ..Default::default()
            },
            upstream_model: "gpt-4".into(),
            weight: 1.0,
            priority: 0,
            rpm_limit: None,
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            timeout_secs: 60,
            tags: vec![],
            enabled: true,
        }
    }

    #[test]
    fn url_includes_deployment_and_api_version() {
        let adapter = AzureAdapter::from_instance(&instance(Some("gpt4-prod"), Some("2024-06-01")));
        assert_eq!(
            adapter.url("chat/completions"),
            "https://acct.openai.azure.com/openai/deployments/gpt4-prod/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn deployment_defaults_to_upstream_model() {
        let adapter = AzureAdapter::from_instance(&instance(None, None));
        assert_eq!(adapter.deployment, "gpt-4");
        assert_eq!(adapter.api_version, DEFAULT_API_VERSION);
    }
}
