//! OpenAI adapter — also serves any OpenAI-compatible endpoint.
//!
//! Because the gateway's canonical shapes are already the OpenAI schema,
//! translation is a model-name override plus credential headers. This
//! adapter handles the majority of configured instances: OpenAI proper,
//! vLLM, Together, Fireworks, OpenRouter, and friends.

use async_trait::async_trait;
use futures::StreamExt;
use pllm_core::adapter::{Adapter, ChunkReceiver};
use pllm_core::error::AdapterError;
use pllm_core::instance::ModelInstance;
use pllm_core::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionRequest,
    CompletionResponse, EmbeddingRequest, EmbeddingResponse,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::sse::{SseBuffer, SseEvent};
use crate::{retry_after_secs, status_error, transport_error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Forward an OpenAI-shaped SSE response into a chunk channel.
///
/// Shared by every adapter whose upstream already speaks OpenAI chunks
/// (OpenAI, Azure, Vertex's OpenAI-compatible endpoint). Dropping the
/// receiver stops the task on its next send, which drops the response
/// and closes the upstream connection.
pub(crate) fn spawn_chunk_forwarder(provider: String, response: reqwest::Response) -> ChunkReceiver {
    let (tx, rx) = tokio::sync::mpsc::channel(64);

    tokio::spawn(async move {
        let mut byte_stream = response.bytes_stream();
        let mut buffer = SseBuffer::new();

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = match chunk_result {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(AdapterError::Network(e.to_string()))).await;
                    return;
                }
            };

            for event in buffer.push(&bytes) {
                match event {
                    SseEvent::Done => return, // channel close is the terminal marker
                    SseEvent::Data(data) => {
                        match serde_json::from_str::<ChatCompletionChunk>(&data) {
                            Ok(chunk) => {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    // receiver dropped: client went away
                                    return;
                                }
                            }
                            Err(e) => {
                                trace!(provider = %provider, error = %e, "ignoring unparseable SSE chunk");
                            }
                        }
                    }
                }
            }
        }
        // Upstream ended without [DONE] — channel close still terminates
    });

    rx
}

/// An OpenAI or OpenAI-compatible upstream.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    org_id: Option<String>,
    upstream_model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn from_instance(instance: &ModelInstance) -> Self {
        Self {
            name: instance.provider.to_string(),
            base_url: instance
                .params
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key: instance.params.api_key.clone().unwrap_or_default(),
            org_id: instance.params.org_id.clone(),
            upstream_model: instance.upstream_model.clone(),
            timeout_secs: instance.timeout_secs,
            client: crate::http_client(),
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if let Some(org) = &self.org_id {
            builder = builder.header("OpenAI-Organization", org);
        }
        builder
    }

    /// Swap in the upstream model name, leaving the rest untouched.
    fn rewrite_model(&self, request: &ChatCompletionRequest) -> ChatCompletionRequest {
        let mut req = request.clone();
        req.model = self.upstream_model.clone();
        req
    }

    async fn check_response(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, AdapterError> {
        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status, body = %body, "upstream returned error");
        Err(status_error(status, body, retry_after))
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, AdapterError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = self.rewrite_model(request);
        body.stream = false;

        debug!(provider = %self.name, model = %body.model, "sending chat completion");

        let response = self
            .request(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let response = self.check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("chat completion decode: {e}")))
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, AdapterError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::to_value(self.rewrite_model(request))
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        body["stream"] = serde_json::json!(true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!(provider = %self.name, "sending streaming chat completion");

        let response = self
            .request(&url)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let response = self.check_response(response).await?;
        Ok(spawn_chunk_forwarder(self.name.clone(), response))
    }

    async fn completion(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, AdapterError> {
        let url = format!("{}/completions", self.base_url);
        let mut body = request.clone();
        body.model = self.upstream_model.clone();
        body.stream = false;

        let response = self
            .request(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let response = self.check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("completion decode: {e}")))
    }

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, AdapterError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut body = request.clone();
        body.model = self.upstream_model.clone();

        let response = self
            .request(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let response = self.check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("embedding decode: {e}")))
    }

    async fn health(&self) -> std::result::Result<(), AdapterError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| transport_error(e, 10))?;
        self.check_response(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::{ProviderParams, ProviderType};
    use pllm_core::openai::ChatMessage;

    fn instance(base_url: Option<&str>) -> ModelInstance {
        ModelInstance {
            id: "gpt-4/openai".into(),
            logical_name: "gpt-4".into(),
            instance_name: "openai".into(),
            provider: ProviderType::Openai,
            params: ProviderParams {
                api_key: Some("sk-test".into()),
                base_url: base_url.map(String::from),
                ..Default::default()
            },
            upstream_model: "gpt-4-0613".into(),
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
    fn default_base_url() {
        let adapter = OpenAiAdapter::from_instance(&instance(None));
        assert_eq!(adapter.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn custom_base_url_trailing_slash_trimmed() {
        let adapter = OpenAiAdapter::from_instance(&instance(Some("http://vllm:8000/v1/")));
        assert_eq!(adapter.base_url, "http://vllm:8000/v1");
    }

    #[test]
    fn model_rewritten_to_upstream_name() {
        let adapter = OpenAiAdapter::from_instance(&instance(None));
        let req = ChatCompletionRequest {
            model: "gpt-4".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            stop: None,
            tools: None,
            user: None,
        };
        assert_eq!(adapter.rewrite_model(&req).model, "gpt-4-0613");
    }
}
