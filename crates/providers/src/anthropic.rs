//! Anthropic adapter — Messages API dialect.
//!
//! Differences from the canonical shape handled here:
//! - system prompt is a top-level field, not a message
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - `max_tokens` is mandatory
//! - streaming events are named (`content_block_delta`, `message_delta`)
//!   and must be re-shaped into OpenAI chat chunks

use async_trait::async_trait;
use futures::StreamExt;
use pllm_core::adapter::{Adapter, ChunkReceiver};
use pllm_core::error::AdapterError;
use pllm_core::instance::ModelInstance;
use pllm_core::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::sse::{SseBuffer, SseEvent};
use crate::{retry_after_secs, status_error, transport_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API upstream.
pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    upstream_model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn from_instance(instance: &ModelInstance) -> Self {
        Self {
            base_url: instance
                .params
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key: instance.params.api_key.clone().unwrap_or_default(),
            upstream_model: instance.upstream_model.clone(),
            timeout_secs: instance.timeout_secs,
            client: crate::http_client(),
        }
    }

    /// Split system messages out and map the rest to Anthropic turns.
    fn to_wire(&self, request: &ChatCompletionRequest, stream: bool) -> serde_json::Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut turns: Vec<serde_json::Value> = Vec::new();

        for msg in &request.messages {
            let content = msg.content.as_deref().unwrap_or_default();
            match msg.role.as_str() {
                "system" => system_parts.push(content),
                "assistant" => turns.push(serde_json::json!({
                    "role": "assistant",
                    "content": content,
                })),
                // user, tool, and anything else become user turns
                _ => turns.push(serde_json::json!({
                    "role": "user",
                    "content": content,
                })),
            }
        }

        let mut body = serde_json::json!({
            "model": self.upstream_model,
            "messages": turns,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = serde_json::json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = serde_json::json!(stop.clone().into_vec());
        }

        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AdapterError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
        warn!(provider = "anthropic", status, body = %text, "upstream returned error");
        Err(status_error(status, text, retry_after))
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, AdapterError> {
        debug!(provider = "anthropic", model = %self.upstream_model, "sending chat completion");
        let body = self.to_wire(request, false);
        let response = self.send(&body, false).await?;

        let wire: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("messages decode: {e}")))?;

        let text: String = wire
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatCompletionResponse {
            id: wire.id,
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: wire.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(text),
                finish_reason: Some(map_stop_reason(wire.stop_reason.as_deref())),
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
        debug!(provider = "anthropic", model = %self.upstream_model, "sending streaming chat completion");
        let body = self.to_wire(request, true);
        let response = self.send(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let model = self.upstream_model.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = SseBuffer::new();
            let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            let created = chrono::Utc::now().timestamp();
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(AdapterError::Network(e.to_string()))).await;
                        return;
                    }
                };

                for event in buffer.push(&bytes) {
                    let data = match event {
                        SseEvent::Done => return,
                        SseEvent::Data(d) => d,
                    };

                    let parsed: StreamEvent = match serde_json::from_str(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            trace!(provider = "anthropic", error = %e, "ignoring unparseable SSE chunk");
                            continue;
                        }
                    };

                    match parsed {
                        StreamEvent::MessageStart { message } => {
                            input_tokens = message.usage.input_tokens;
                        }
                        StreamEvent::ContentBlockDelta { delta } => {
                            if let Some(text) = delta.text {
                                let chunk = ChatCompletionChunk::delta(
                                    &chunk_id,
                                    created,
                                    &model,
                                    Some(text),
                                    None,
                                );
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        StreamEvent::MessageDelta { delta, usage } => {
                            if let Some(u) = usage {
                                output_tokens = u.output_tokens;
                            }
                            if let Some(reason) = delta.stop_reason {
                                let mut chunk = ChatCompletionChunk::delta(
                                    &chunk_id,
                                    created,
                                    &model,
                                    None,
                                    Some(map_stop_reason(Some(&reason))),
                                );
                                chunk.usage = Some(Usage {
                                    prompt_tokens: input_tokens,
                                    completion_tokens: output_tokens,
                                    total_tokens: input_tokens + output_tokens,
                                });
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        StreamEvent::MessageStop => return,
                        StreamEvent::Error { error } => {
                            let _ = tx
                                .send(Err(AdapterError::Upstream5xx {
                                    status: 502,
                                    message: error.message,
                                }))
                                .await;
                            return;
                        }
                        StreamEvent::Other => {}
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> std::result::Result<(), AdapterError> {
        // Anthropic has no cheap list endpoint; a HEAD-sized message with
        // max_tokens 1 would bill. Reachability of the host is enough.
        let response = self
            .client
            .get(&self.base_url)
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

fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        Some("max_tokens") => "length".into(),
        Some("tool_use") => "tool_calls".into(),
        _ => "stop".into(),
    }
}

// --- Anthropic wire types (internal) ---

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: StopDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::instance::{ProviderParams, ProviderType};
    use pllm_core::openai::StringOrList;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::from_instance(&ModelInstance {
            id: "claude/anthropic".into(),
            logical_name: "claude".into(),
            instance_name: "anthropic".into(),
            provider: ProviderType::Anthropic,
            params: ProviderParams { api_key: Some("k".into()), ..Default::default() },
            upstream_model: "claude-sonnet-4".into(),
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

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude".into(),
            messages,
            max_tokens: None,
            temperature: Some(0.5),
            top_p: None,
            stream: false,
            stop: Some(StringOrList::One("END".into())),
            tools: None,
            user: None,
        }
    }

    #[test]
    fn system_prompt_extracted_to_top_level() {
        let body = adapter().to_wire(
            &request(vec![
                ChatMessage::system("You are terse."),
                ChatMessage::user("hello"),
            ]),
            false,
        );
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn multiple_system_messages_joined() {
        let body = adapter().to_wire(
            &request(vec![
                ChatMessage::system("a"),
                ChatMessage::system("b"),
                ChatMessage::user("x"),
            ]),
            false,
        );
        assert_eq!(body["system"], "a\n\nb");
    }

    #[test]
    fn max_tokens_defaulted_and_stop_mapped() {
        let body = adapter().to_wire(&request(vec![ChatMessage::user("x")]), false);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["model"], "claude-sonnet-4");
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("tool_use")), "tool_calls");
        assert_eq!(map_stop_reason(None), "stop");
    }

    #[test]
    fn parse_content_block_delta_event() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        match serde_json::from_str::<StreamEvent>(data).unwrap() {
            StreamEvent::ContentBlockDelta { delta } => {
                assert_eq!(delta.text.as_deref(), Some("Hi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_message_delta_with_usage() {
        let data = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#;
        match serde_json::from_str::<StreamEvent>(data).unwrap() {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
                assert_eq!(usage.unwrap().output_tokens, 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_tolerated() {
        let data = r#"{"type":"content_block_start","index":0}"#;
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(data).unwrap(),
            StreamEvent::Other
        ));
    }
}
