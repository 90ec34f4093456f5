//! Adapter trait — the abstraction over upstream LLM providers.
//!
//! An Adapter translates the canonical OpenAI-compatible shapes to the
//! provider's wire dialect and back. Streaming hands back an mpsc
//! receiver of already-normalized chunks; dropping the receiver cancels
//! the upstream read.
//!
//! Implementations: OpenAI, Anthropic, Azure, Bedrock, Vertex, and any
//! OpenAI-compatible endpoint.

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionRequest,
    CompletionResponse, EmbeddingRequest, EmbeddingResponse,
};

/// Receiver half of a streaming completion.
///
/// The producer task closes the channel after the terminal chunk; a
/// mid-stream upstream failure is delivered as one `Err` and then the
/// channel closes. The consumer maps channel-close to `data: [DONE]`.
pub type ChunkReceiver =
    tokio::sync::mpsc::Receiver<std::result::Result<ChatCompletionChunk, AdapterError>>;

/// The provider adapter contract.
///
/// Every upstream family implements this trait. The router calls it
/// without knowing which provider is behind the instance.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Provider family name (e.g. "openai", "anthropic", "bedrock").
    fn provider_name(&self) -> &str;

    /// Non-streaming chat completion.
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, AdapterError>;

    /// Streaming chat completion in OpenAI SSE chunk shape.
    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChunkReceiver, AdapterError>;

    /// Legacy text completion.
    ///
    /// Default implementation maps the prompt onto a single-user-message
    /// chat call, which is how most modern providers serve it anyway.
    async fn completion(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, AdapterError> {
        let prompt = match &request.prompt {
            crate::openai::StringOrList::One(s) => s.clone(),
            crate::openai::StringOrList::Many(v) => v.join("\n"),
        };
        let chat_req = ChatCompletionRequest {
            model: request.model.clone(),
            messages: vec![crate::openai::ChatMessage::user(prompt)],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: None,
            stream: false,
            stop: request.stop.clone(),
            tools: None,
            user: request.user.clone(),
        };
        let resp = self.chat_completion(&chat_req).await?;
        let choices = resp
            .choices
            .into_iter()
            .map(|c| crate::openai::CompletionChoice {
                index: c.index,
                text: c.message.content.unwrap_or_default(),
                finish_reason: c.finish_reason,
            })
            .collect();
        Ok(CompletionResponse {
            id: resp.id,
            object: "text_completion".into(),
            created: resp.created,
            model: resp.model,
            choices,
            usage: resp.usage,
        })
    }

    /// Generate embeddings.
    ///
    /// Default implementation reports the capability as missing.
    async fn embeddings(
        &self,
        _request: &EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, AdapterError> {
        Err(AdapterError::Upstream4xx {
            status: 400,
            message: format!("provider '{}' does not support embeddings", self.provider_name()),
        })
    }

    /// Health probe — can we reach the provider with these credentials?
    async fn health(&self) -> std::result::Result<(), AdapterError> {
        Ok(())
    }
}
