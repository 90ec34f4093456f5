//! Non-LLM surface: model listing, health, readiness, metrics.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use pllm_core::error::GatewayError;
use pllm_core::openai::{ModelList, ModelObject};
use serde::Serialize;

use crate::middleware::ApiError;
use crate::state::SharedState;

/// `GET /v1/models` — logical model names known to the registry.
pub async fn list_models(State(state): State<SharedState>) -> axum::Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .registry
        .logical_models()
        .into_iter()
        .map(|id| ModelObject {
            id: id.clone(),
            object: "model".into(),
            created,
            owned_by: "pllm".into(),
            root: id,
        })
        .collect();
    axum::Json(ModelList { object: "list".into(), data })
}

/// `GET /v1/models/{id}`
pub async fn get_model(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<axum::Json<ModelObject>, ApiError> {
    let resolved = state.config.resolve_alias(&id).to_string();
    if state.registry.instances_for(&resolved).is_none() {
        return Err(ApiError(GatewayError::ModelNotFound(id)));
    }
    Ok(axum::Json(ModelObject {
        id: resolved.clone(),
        object: "model".into(),
        created: chrono::Utc::now().timestamp(),
        owned_by: "pllm".into(),
        root: resolved,
    }))
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `GET /health` — liveness only.
pub async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    database: bool,
    redis: bool,
}

/// `GET /ready` — checks the database and Redis.
pub async fn ready(State(state): State<SharedState>) -> impl IntoResponse {
    let database = state.store.ping().await.is_ok();
    let redis = match &state.redis {
        Some(redis) => {
            let mut redis = redis.clone();
            redis::cmd("PING").query_async::<String>(&mut redis).await.is_ok()
        }
        None => true, // not configured: nothing to wait for
    };

    let all_ready = database && redis;
    let status = if all_ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        axum::Json(ReadyResponse {
            status: if all_ready { "ready" } else { "degraded" },
            database,
            redis,
        }),
    )
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
