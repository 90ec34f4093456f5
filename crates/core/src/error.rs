//! Error types for the pllm domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; `GatewayError` is the
//! client-facing taxonomy that maps onto the OpenAI-style
//! `{error:{message,type,code}}` wire shape and an HTTP status.

use thiserror::Error;

/// The client-facing error taxonomy.
///
/// Every failure surfaced on the HTTP boundary is one of these. The
/// `error_type` / `code` / `status` accessors drive the wire rendering.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited{}", .retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The OpenAI-style `error.type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Unauthorized(_) => "authentication_error",
            Self::Forbidden(_) => "permission_error",
            Self::ModelNotFound(_) => "invalid_request_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::BudgetExceeded(_) => "budget_error",
            Self::UpstreamTimeout(_) | Self::UpstreamError(_) => "api_error",
            Self::Internal(_) => "api_error",
        }
    }

    /// The stable `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ModelNotFound(_) => "model_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamError(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::ModelNotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::BudgetExceeded(_) => 402,
            Self::UpstreamTimeout(_) => 408,
            Self::UpstreamError(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Render the OpenAI-style error body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        })
    }
}

/// Result type alias using `GatewayError`.
pub type Result<T> = std::result::Result<T, GatewayError>;

// --- Bounded context errors ---

/// Errors produced by provider adapters.
///
/// `Clone` because streaming fan-out and retry bookkeeping both need to
/// hold onto the last error.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("Request canceled by client")]
    Canceled,

    #[error("Upstream timed out after {0}s")]
    Timeout(u64),

    #[error("Upstream failure (status {status}): {message}")]
    Upstream5xx { status: u16, message: String },

    #[error("Upstream rejected request (status {status}): {message}")]
    Upstream4xx { status: u16, message: String },

    #[error("Rate limited by upstream, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication with upstream failed: {0}")]
    Auth(String),

    #[error("Malformed upstream response: {0}")]
    Malformed(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl AdapterError {
    /// Whether the router may retry this failure on another instance.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Upstream5xx { .. } | Self::RateLimited { .. } | Self::Network(_)
        )
    }
}

impl From<AdapterError> for GatewayError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Canceled => GatewayError::Internal("request canceled".into()),
            AdapterError::Timeout(secs) => GatewayError::UpstreamTimeout(secs),
            AdapterError::RateLimited { retry_after_secs } => GatewayError::RateLimited {
                retry_after: Some(retry_after_secs),
            },
            AdapterError::Upstream4xx { status: 404, message } => {
                GatewayError::ModelNotFound(message)
            }
            AdapterError::Upstream4xx { message, .. } => GatewayError::InvalidRequest(message),
            AdapterError::Auth(msg) => GatewayError::UpstreamError(format!("upstream auth: {msg}")),
            AdapterError::Upstream5xx { message, .. }
            | AdapterError::Malformed(message)
            | AdapterError::Network(message) => GatewayError::UpstreamError(message),
        }
    }
}

/// Errors from credential validation and principal resolution.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing or unrecognized credential")]
    Unauthorized,

    #[error("Key is expired or revoked")]
    KeyExpired,

    #[error("Key budget exceeded")]
    BudgetExceeded,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Storage error during authentication: {0}")]
    Storage(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => GatewayError::Unauthorized("invalid API key".into()),
            AuthError::KeyExpired => GatewayError::Unauthorized("key expired or revoked".into()),
            AuthError::BudgetExceeded => GatewayError::BudgetExceeded("key budget exhausted".into()),
            AuthError::InvalidToken(msg) => GatewayError::Unauthorized(msg),
            AuthError::Storage(msg) => GatewayError::Internal(msg),
        }
    }
}

/// Errors from the router.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("No instances registered for model: {0}")]
    ModelNotFound(String),

    #[error("All instances for model '{model}' are unavailable: {reason}")]
    NoHealthyInstance { model: String, reason: String },

    #[error("Retries exhausted for model '{model}': {last_error}")]
    RetriesExhausted { model: String, last_error: AdapterError },
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::ModelNotFound(m) => GatewayError::ModelNotFound(m),
            RouteError::NoHealthyInstance { model, reason } => {
                GatewayError::UpstreamError(format!("no usable instance for '{model}': {reason}"))
            }
            RouteError::RetriesExhausted { last_error, .. } => last_error.into(),
        }
    }
}

/// Errors from the budget cache and usage queue.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded for {entity_type} {entity_id}")]
    Exceeded {
        entity_type: String,
        entity_id: String,
    },

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BudgetError> for GatewayError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::Exceeded { entity_type, entity_id } => {
                GatewayError::BudgetExceeded(format!("{entity_type} {entity_id}"))
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(GatewayError::Unauthorized("x".into()).status(), 401);
        assert_eq!(GatewayError::BudgetExceeded("x".into()).status(), 402);
        assert_eq!(GatewayError::Forbidden("x".into()).status(), 403);
        assert_eq!(GatewayError::ModelNotFound("x".into()).status(), 404);
        assert_eq!(GatewayError::UpstreamTimeout(60).status(), 408);
        assert_eq!(GatewayError::RateLimited { retry_after: None }.status(), 429);
        assert_eq!(GatewayError::UpstreamError("x".into()).status(), 502);
        assert_eq!(GatewayError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn error_body_shape() {
        let body = GatewayError::BudgetExceeded("team t1".into()).to_body();
        assert_eq!(body["error"]["code"], "budget_exceeded");
        assert_eq!(body["error"]["type"], "budget_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("t1"));
    }

    #[test]
    fn retryable_adapter_errors() {
        assert!(AdapterError::Timeout(30).is_retryable());
        assert!(AdapterError::Network("conn refused".into()).is_retryable());
        assert!(
            AdapterError::Upstream5xx { status: 503, message: "overloaded".into() }.is_retryable()
        );
        assert!(AdapterError::RateLimited { retry_after_secs: 5 }.is_retryable());
        assert!(
            !AdapterError::Upstream4xx { status: 400, message: "bad schema".into() }.is_retryable()
        );
        assert!(!AdapterError::Auth("bad key".into()).is_retryable());
        assert!(!AdapterError::Canceled.is_retryable());
    }

    #[test]
    fn rate_limited_conversion_carries_retry_after() {
        let err: GatewayError = AdapterError::RateLimited { retry_after_secs: 7 }.into();
        match err {
            GatewayError::RateLimited { retry_after } => assert_eq!(retry_after, Some(7)),
            other => panic!("expected RateLimited, got: {other:?}"),
        }
    }
}
