//! The per-request middleware chain.
//!
//! Order: request id → panic recovery (layered in the router builder) →
//! CORS → authentication → rate limit. Budget admission runs as the
//! first step of the LLM handlers because it needs the parsed body for
//! cost estimation; it keeps the same position in the logical chain
//! (post-auth, post-rate-limit, pre-dispatch).

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use pllm_core::error::GatewayError;
use pllm_core::principal::{EffectiveLimits, Principal, PrincipalKind};
use tracing::{info, warn};

use crate::state::SharedState;

/// Newtype adapter rendering a [`GatewayError`] as the OpenAI-style
/// error body with the right status and headers.
pub struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, axum::Json(self.0.to_body())).into_response();
        if let GatewayError::RateLimited { retry_after: Some(secs) } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl From<pllm_core::error::AuthError> for ApiError {
    fn from(err: pllm_core::error::AuthError) -> Self {
        Self(err.into())
    }
}

impl From<pllm_core::error::RouteError> for ApiError {
    fn from(err: pllm_core::error::RouteError) -> Self {
        Self(err.into())
    }
}

impl From<pllm_core::error::BudgetError> for ApiError {
    fn from(err: pllm_core::error::BudgetError) -> Self {
        Self(err.into())
    }
}

/// Attach a request id, propagate it on the response, and open a log
/// context for the request.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let mut response = next.run(req).await;

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// The request id attached by [`request_id_middleware`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Turn panics inside handlers into a JSON `internal_error`.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    ApiError(GatewayError::Internal("unexpected server error".into())).into_response()
}

/// Authentication middleware: validates the bearer and attaches the
/// [`Principal`] to the request extensions.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    let principal = match bearer {
        Some(bearer) => state.authenticator.validate(bearer).await?,
        None if !state.config.auth.require_auth => anonymous_principal(),
        None => return Err(ApiError(GatewayError::Unauthorized("missing bearer token".into()))),
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// The principal handed out when `require_auth` is off.
fn anonymous_principal() -> Principal {
    Principal {
        kind: PrincipalKind::System,
        user_id: None,
        team_id: None,
        key_id: None,
        allowed_models: Vec::new(),
        blocked_models: Vec::new(),
        limits: EffectiveLimits::default(),
        is_admin: false,
    }
}

/// Rate limit keyed by key id when present, else by client IP. Master
/// principals are exempt.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.rate_limit.enabled {
        return Ok(next.run(req).await);
    }

    let principal = req.extensions().get::<Principal>().cloned();
    if principal.as_ref().is_some_and(|p| p.is_master()) {
        return Ok(next.run(req).await);
    }

    let (bucket_key, limit) = match principal.as_ref() {
        Some(p) => match p.rate_limit_key() {
            Some(key_id) => (format!("key:{key_id}"), p.limits.rpm),
            None => (format!("ip:{}", client_ip(&req)), p.limits.rpm),
        },
        None => (format!("ip:{}", client_ip(&req)), None),
    };

    if !state.rate_limiter.allow(&bucket_key, limit) {
        warn!(bucket = %bucket_key, "rate limit exceeded");
        return Err(ApiError(GatewayError::RateLimited {
            retry_after: Some(state.config.rate_limit.window_secs),
        }));
    }

    Ok(next.run(req).await)
}

/// Admin gate: only admin-role principals pass.
pub async fn admin_middleware(req: Request, next: Next) -> Result<Response, ApiError> {
    let is_admin = req
        .extensions()
        .get::<Principal>()
        .is_some_and(|p| p.is_admin);
    if !is_admin {
        return Err(ApiError(GatewayError::Forbidden("admin role required".into())));
    }
    Ok(next.run(req).await)
}

fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_sets_retry_after() {
        let response =
            ApiError(GatewayError::RateLimited { retry_after: Some(30) }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");
    }

    #[test]
    fn api_error_maps_status() {
        let response = ApiError(GatewayError::BudgetExceeded("k".into())).into_response();
        assert_eq!(response.status().as_u16(), 402);
    }

    #[test]
    fn anonymous_principal_has_no_privileges() {
        let p = anonymous_principal();
        assert!(!p.is_admin);
        assert!(!p.is_master());
        assert!(p.budget_entities().is_empty());
    }
}
