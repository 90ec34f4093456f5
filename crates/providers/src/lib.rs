//! Provider adapters — translate canonical requests to upstream dialects.
//!
//! Each supported provider family gets one [`Adapter`] implementation.
//! The factory in this module builds the right adapter for a
//! [`ModelInstance`] from its provider type and parameters.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod openai;
pub mod sigv4;
pub mod sse;
pub mod vertex;

use std::sync::Arc;
use std::time::Duration;

use pllm_core::adapter::Adapter;
use pllm_core::error::AdapterError;
use pllm_core::instance::{ModelInstance, ProviderType};

/// Build the adapter for an instance.
///
/// The returned adapter is immutable and cheap to share; the registry
/// caches one per instance.
pub fn adapter_for(instance: &ModelInstance) -> Arc<dyn Adapter> {
    match instance.provider {
        ProviderType::Openai | ProviderType::OpenaiCompatible => {
            Arc::new(openai::OpenAiAdapter::from_instance(instance))
        }
        ProviderType::Anthropic => Arc::new(anthropic::AnthropicAdapter::from_instance(instance)),
        ProviderType::Azure => Arc::new(azure::AzureAdapter::from_instance(instance)),
        ProviderType::Bedrock => Arc::new(bedrock::BedrockAdapter::from_instance(instance)),
        ProviderType::Vertex => Arc::new(vertex::VertexAdapter::from_instance(instance)),
    }
}

/// Shared HTTP client: connect timeout only. Total deadlines are applied
/// per call so long-lived SSE streams are not cut off by a blanket
/// client timeout.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

/// Map an upstream error status + body into the adapter taxonomy.
pub(crate) fn status_error(status: u16, body: String, retry_after: Option<u64>) -> AdapterError {
    match status {
        429 => AdapterError::RateLimited { retry_after_secs: retry_after.unwrap_or(5) },
        401 | 403 => AdapterError::Auth(body),
        400..=499 => AdapterError::Upstream4xx { status, message: body },
        _ => AdapterError::Upstream5xx { status, message: body },
    }
}

/// Map a reqwest transport failure into the adapter taxonomy.
pub(crate) fn transport_error(err: reqwest::Error, timeout_secs: u64) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout_secs)
    } else {
        AdapterError::Network(err.to_string())
    }
}

/// Parse a `Retry-After` header value in seconds.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_classes() {
        assert!(matches!(
            status_error(429, "slow down".into(), Some(30)),
            AdapterError::RateLimited { retry_after_secs: 30 }
        ));
        assert!(matches!(status_error(401, "no".into(), None), AdapterError::Auth(_)));
        assert!(matches!(
            status_error(422, "bad".into(), None),
            AdapterError::Upstream4xx { status: 422, .. }
        ));
        assert!(matches!(
            status_error(503, "down".into(), None),
            AdapterError::Upstream5xx { status: 503, .. }
        ));
    }

    #[test]
    fn factory_picks_provider_family() {
        let mut instance = ModelInstance {
            id: "m/openai".into(),
            logical_name: "m".into(),
            instance_name: "openai".into(),
            provider: ProviderType::Openai,
            params: Default::default(),
            upstream_model: "m".into(),
            weight: 1.0,
            priority: 0,
            rpm_limit: None,
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            timeout_secs: 60,
            tags: vec![],
            enabled: true,
        };
        assert_eq!(adapter_for(&instance).provider_name(), "openai");

        instance.provider = ProviderType::Anthropic;
        assert_eq!(adapter_for(&instance).provider_name(), "anthropic");

        instance.provider = ProviderType::Bedrock;
        assert_eq!(adapter_for(&instance).provider_name(), "bedrock");
    }
}
