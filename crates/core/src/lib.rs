//! # pllm Core
//!
//! Domain types, traits, and error definitions for the pllm gateway.
//! This crate has **zero framework dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The request plane is defined as traits and value objects here.
//! Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod adapter;
pub mod error;
pub mod instance;
pub mod openai;
pub mod principal;
pub mod usage;

// Re-export key types at crate root for ergonomics
pub use adapter::{Adapter, ChunkReceiver};
pub use error::{AdapterError, AuthError, BudgetError, GatewayError, Result, RouteError};
pub use instance::{InstanceId, ModelInstance, ProviderParams, ProviderType};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Usage,
};
pub use principal::{EffectiveLimits, Principal, PrincipalKind};
pub use usage::{RequestEvent, UsageRecord};
