//! Admin key management: list, create, revoke, validate.
//!
//! Served on the admin port behind the admin-role gate. Key plaintext is
//! returned exactly once at creation; every mutation writes an audit row.

use axum::Extension;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use pllm_auth::{generate_api_key, hash_credential, key_prefix};
use pllm_core::error::GatewayError;
use pllm_core::principal::Principal;
use pllm_storage::KeyRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::middleware::ApiError;
use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct KeySummary {
    pub id: String,
    pub key_prefix: String,
    pub key_type: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub is_active: bool,
    pub current_spend: f64,
    pub max_budget: Option<f64>,
    pub usage_count: i64,
}

impl From<KeyRecord> for KeySummary {
    fn from(key: KeyRecord) -> Self {
        Self {
            id: key.id,
            key_prefix: key.key_prefix,
            key_type: key.key_type,
            user_id: key.user_id,
            team_id: key.team_id,
            is_active: key.is_active,
            current_spend: key.current_spend,
            max_budget: key.max_budget,
            usage_count: key.usage_count,
        }
    }
}

/// `GET /admin/keys`
pub async fn list_keys(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let keys = state
        .store
        .list_keys(500)
        .await
        .map_err(|e| ApiError(GatewayError::Internal(e.to_string())))?;
    let summaries: Vec<KeySummary> = keys.into_iter().map(KeySummary::from).collect();
    Ok(axum::Json(summaries))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub blocked_models: Vec<String>,
    #[serde(default)]
    pub rpm: Option<i32>,
    #[serde(default)]
    pub tpm: Option<i32>,
    #[serde(default)]
    pub max_parallel: Option<i32>,
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default)]
    pub budget_period: Option<String>,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

fn default_key_type() -> String {
    "api".into()
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    pub id: String,
    /// The plaintext. Shown once, never stored.
    pub key: String,
    pub key_prefix: String,
}

/// `POST /admin/keys`
pub async fn create_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    axum::Json(request): axum::Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Non-system keys belong to exactly one of user or team.
    if request.key_type != "system" && request.user_id.is_some() == request.team_id.is_some() {
        return Err(ApiError(GatewayError::InvalidRequest(
            "exactly one of user_id or team_id must be set".into(),
        )));
    }

    let plaintext = generate_api_key();
    let key_hash = hash_credential(&plaintext);
    let record = KeyRecord {
        id: uuid::Uuid::new_v4().to_string(),
        key_hash: key_hash.clone(),
        key_prefix: key_prefix(&key_hash),
        key_type: request.key_type,
        user_id: request.user_id,
        team_id: request.team_id,
        is_active: true,
        expires_at: request.expires_at,
        revoked_at: None,
        scopes: Vec::new(),
        allowed_models: request.allowed_models,
        blocked_models: request.blocked_models,
        rpm: request.rpm,
        tpm: request.tpm,
        max_parallel: request.max_parallel,
        max_budget: request.max_budget,
        budget_period: request.budget_period,
        current_spend: 0.0,
        budget_reset_at: None,
        usage_count: 0,
        total_tokens: 0,
        total_cost: 0.0,
    };

    state
        .store
        .insert_key(&record)
        .await
        .map_err(|e| ApiError(GatewayError::Internal(e.to_string())))?;

    let actor = principal.user_id.as_deref().unwrap_or("master").to_string();
    let detail = serde_json::json!({"key_prefix": record.key_prefix, "key_type": record.key_type});
    if let Err(e) = state.store.insert_audit(&actor, "key.create", &record.id, &detail).await {
        tracing::warn!(error = %e, "audit write failed");
    }

    info!(key_id = %record.id, prefix = %record.key_prefix, "API key created");

    Ok((
        StatusCode::CREATED,
        axum::Json(CreateKeyResponse {
            id: record.id,
            key: plaintext,
            key_prefix: record.key_prefix,
        }),
    ))
}

/// `DELETE /admin/keys/{id}` — revoke, never destroy.
pub async fn revoke_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = state
        .store
        .revoke_key(&id)
        .await
        .map_err(|e| ApiError(GatewayError::Internal(e.to_string())))?;
    if !revoked {
        return Err(ApiError(GatewayError::ModelNotFound(format!("key {id}"))));
    }

    let actor = principal.user_id.as_deref().unwrap_or("master").to_string();
    if let Err(e) = state
        .store
        .insert_audit(&actor, "key.revoke", &id, &serde_json::json!({}))
        .await
    {
        tracing::warn!(error = %e, "audit write failed");
    }

    info!(key_id = %id, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ValidateKeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateKeyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /admin/keys/validate` — exercise the full validation path.
pub async fn validate_key(
    State(state): State<SharedState>,
    axum::Json(request): axum::Json<ValidateKeyRequest>,
) -> axum::Json<ValidateKeyResponse> {
    match state.authenticator.validate(&request.key).await {
        Ok(principal) => axum::Json(ValidateKeyResponse {
            valid: true,
            principal: Some(principal),
            error: None,
        }),
        Err(e) => axum::Json(ValidateKeyResponse {
            valid: false,
            principal: None,
            error: Some(e.to_string()),
        }),
    }
}
