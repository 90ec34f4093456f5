//! AWS Bedrock adapter.
//!
//! Speaks the Anthropic messages dialect over Bedrock's `invoke-model`
//! runtime endpoint with SigV4-signed requests. Streaming falls back to
//! a single terminal chunk from the non-streaming call: Bedrock's
//! response-stream framing is a binary event-stream protocol, and the
//! one-chunk fallback keeps the SSE contract intact for clients.

use async_trait::async_trait;
use pllm_core::adapter::{Adapter, ChunkReceiver};
use pllm_core::error::AdapterError;
use pllm_core::instance::ModelInstance;
use pllm_core::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::sigv4::{SigningParams, sign_post};
use crate::{retry_after_secs, status_error, transport_error};

const ANTHROPIC_BEDROCK_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// A Bedrock-hosted model invoked through the runtime API.
pub struct BedrockAdapter {
    region: String,
    access_key_id: String,
    secret_access_key: String,
    model_id: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl BedrockAdapter {
    pub fn from_instance(instance: &ModelInstance) -> Self {
        Self {
            region: instance.params.aws_region.clone().unwrap_or_else(|| "us-east-1".into()),
            access_key_id: instance.params.aws_access_key_id.clone().unwrap_or_default(),
            secret_access_key: instance.params.aws_secret_access_key.clone().unwrap_or_default(),
            model_id: instance.upstream_model.clone(),
            timeout_secs: instance.timeout_secs,
            client: crate::http_client(),
        }
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region)
    }

    /// Bedrock model ids may contain `:` which must stay unescaped in the
    /// canonical URI; everything else we send is URL-safe already.
    fn invoke_path(&self) -> String {
        format!("/model/{}/invoke", self.model_id)
    }

    fn to_wire(&self, request: &ChatCompletionRequest) -> serde_json::Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut turns: Vec<serde_json::Value> = Vec::new();

        for msg in &request.messages {
            let content = msg.content.as_deref().unwrap_or_default();
            match msg.role.as_str() {
                "system" => system_parts.push(content),
                "assistant" => {
                    turns.push(serde_json::json!({"role": "assistant", "content": content}))
                }
                _ => turns.push(serde_json::json!({"role": "user", "content": content})),
            }
        }

        let mut body = serde_json::json!({
            "anthropic_version": ANTHROPIC_BEDROCK_VERSION,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if !system_parts.is_empty() {
            body["system"] = serde_json::json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = serde_json::json!(stop.clone().into_vec());
        }
        body
    }
}

#[async_trait]
impl Adapter for BedrockAdapter {
    fn provider_name(&self) -> &str {
        "bedrock"
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, AdapterError> {
        let host = self.host();
        let path = self.invoke_path();
        let payload = serde_json::to_vec(&self.to_wire(request))
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        let signed = sign_post(
            &SigningParams {
                access_key_id: &self.access_key_id,
                secret_access_key: &self.secret_access_key,
                region: &self.region,
                service: "bedrock",
            },
            &host,
            &path,
            &payload,
            chrono::Utc::now(),
        );

        debug!(provider = "bedrock", model = %self.model_id, region = %self.region, "sending invoke-model");

        let response = self
            .client
            .post(format!("https://{host}{path}"))
            .header("Content-Type", "application/json")
            .header("x-amz-date", &signed.amz_date)
            .header("Authorization", &signed.authorization)
            .timeout(Duration::from_secs(self.timeout_secs))
            .body(payload)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = retry_after_secs(response.headers());
            let text = response.text().await.unwrap_or_default();
            warn!(provider = "bedrock", status, "upstream returned error");
            return Err(status_error(status, text, retry_after));
        }

        let wire: InvokeResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("invoke-model decode: {e}")))?;

        let text: String = wire
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatCompletionResponse {
            id: wire.id.unwrap_or_else(|| format!("bedrock-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: self.model_id.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(text),
                finish_reason: Some(match wire.stop_reason.as_deref() {
                    Some("max_tokens") => "length".into(),
                    _ => "stop".into(),
                }),
            }],
            usage: Some(Usage {
                prompt_tokens: wire.usage.input_tokens,
                completion_tokens: wire.usage.output_tokens,
                total_tokens: wire.usage.input_tokens + wire.usage.output_tokens,
            }),
        })
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, AdapterError> {
        // One-chunk fallback: complete, then emit the whole message as a
        // single delta followed by the finish chunk.
        let response = self.chat_completion(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(2);

        tokio::spawn(async move {
            let content = response
                .choices
                .first()
                .and_then(|c| c.message.content.clone());
            let finish = response
                .choices
                .first()
                .and_then(|c| c.finish_reason.clone());

            let delta = ChatCompletionChunk::delta(
                &response.id,
                response.created,
                &response.model,
                content,
                None,
            );
            if tx.send(Ok(delta)).await.is_err() {
                return;
            }

            let mut last = ChatCompletionChunk::delta(
                &response.id,
                response.created,
                &response.model,
                None,
                finish,
            );
            last.usage = response.usage;
            let _ = tx.send(Ok(last)).await;
        });

        Ok(rx)
    }

    async fn health(&self) -> std::result::Result<(), AdapterError> {
        // A full invoke would bill; resolving and reaching the regional
        // endpoint is the useful part of the probe.
        let response = self
            .client
            .get(format!("https://{}", self.host()))
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

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    id: Option<String>,
    content: Vec<InvokeContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: InvokeUsage,
}

#[derive(Debug, Deserialize)]
struct InvokeContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InvokeUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::{ProviderParams, ProviderType};

    fn adapter() -> BedrockAdapter {
        BedrockAdapter::from_instance(&ModelInstance {
            id: "claude/bedrock".into(),
            logical_name: "claude".into(),
            instance_name: "bedrock".into(),
            provider: ProviderType::Bedrock,
            params: ProviderParams {
                aws_region: Some("eu-west-1".into()),
                aws_access_key_id: Some("AKID".into()),
                aws_secret_access_key: Some("SECRET".into()),
                ..Default::default()
            },
            upstream_model: "anthropic.claude-3-sonnet-20240229-v1:0".into(),
            weight: 1.0,
            priority: 0,
            rpm_limit: None,
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            timeout_secs: 60,
            tags: vec![],
            enabled: true,
        })
    }

    #[test]
    fn regional_host_and_invoke_path() {
        let a = adapter();
        assert_eq!(a.host(), "bedrock-runtime.eu-west-1.amazonaws.com");
        assert_eq!(a.invoke_path(), "/model/anthropic.claude-3-sonnet-20240229-v1:0/invoke");
    }

    #[test]
    fn wire_body_carries_bedrock_dialect() {
        let a = adapter();
        let body = a.to_wire(&ChatCompletionRequest {
            model: "claude".into(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            max_tokens: Some(100),
            temperature: None,
            top_p: None,
            stream: false,
            stop: None,
            tools: None,
            user: None,
        });
        assert_eq!(body["anthropic_version"], ANTHROPIC_BEDROCK_VERSION);
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn parse_invoke_response() {
        let data = r#"{
            "id": "msg_01",
            "content": [{"type":"text","text":"pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 8, "output_tokens": 2}
        }"#;
        let wire: InvokeResponse = serde_json::from_str(data).unwrap();
        assert_eq!(wire.content[0].text.as_deref(), Some("pong"));
        assert_eq!(wire.usage.input_tokens, 8);
    }
}
