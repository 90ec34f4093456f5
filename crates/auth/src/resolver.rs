//! `validate(bearer) -> Principal`.
//!
//! Order: master key (constant-time), JWT (UI flow), hashed key lookup.
//! Effective limits apply the precedence key override > team-member
//! override > team default > user default; the model allowlist takes the
//! key's list when present, otherwise the team's, with blocklists
//! unioned.

use async_trait::async_trait;
use chrono::Utc;
use pllm_core::error::AuthError;
use pllm_core::principal::{EffectiveLimits, Principal, PrincipalKind};
use pllm_storage::{KeyRecord, PgStore, TeamMemberRecord, TeamRecord, UserRecord};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::jwt;
use crate::keys::{hash_credential, looks_like_jwt};

/// Where credentials and their owners are loaded from.
///
/// `PgStore` is the production source; tests use in-memory maps.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>, AuthError>;
    async fn user(&self, id: &str) -> Result<Option<UserRecord>, AuthError>;
    async fn team(&self, id: &str) -> Result<Option<TeamRecord>, AuthError>;
    async fn team_member(
        &self,
        team_id: &str,
        user_id: &str,
    ) -> Result<Option<TeamMemberRecord>, AuthError>;
}

#[async_trait]
impl CredentialSource for PgStore {
    async fn key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>, AuthError> {
        self.find_key_by_hash(key_hash)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }

    async fn user(&self, id: &str) -> Result<Option<UserRecord>, AuthError> {
        self.find_user(id).await.map_err(|e| AuthError::Storage(e.to_string()))
    }

    async fn team(&self, id: &str) -> Result<Option<TeamRecord>, AuthError> {
        self.find_team(id).await.map_err(|e| AuthError::Storage(e.to_string()))
    }

    async fn team_member(
        &self,
        team_id: &str,
        user_id: &str,
    ) -> Result<Option<TeamMemberRecord>, AuthError> {
        self.find_team_member(team_id, user_id)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }
}

/// The credential validator.
pub struct Authenticator<S: CredentialSource> {
    source: S,
    master_key: Option<String>,
    jwt_secret: Option<String>,
}

impl<S: CredentialSource> Authenticator<S> {
    pub fn new(source: S, master_key: Option<String>, jwt_secret: Option<String>) -> Self {
        Self { source, master_key, jwt_secret }
    }

    /// Validate a bearer credential and resolve the principal.
    pub async fn validate(&self, bearer: &str) -> Result<Principal, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::Unauthorized);
        }

        // 1. Master key, constant-time.
        if let Some(master) = &self.master_key {
            if master.len() == bearer.len()
                && bool::from(master.as_bytes().ct_eq(bearer.as_bytes()))
            {
                debug!("master principal authenticated");
                return Ok(Principal::master());
            }
        }

        // 2. JWT (UI flow).
        if looks_like_jwt(bearer) {
            return self.validate_jwt(bearer).await;
        }

        // 3. Hashed key lookup.
        self.validate_key(bearer).await
    }

    async fn validate_jwt(&self, bearer: &str) -> Result<Principal, AuthError> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| AuthError::InvalidToken("JWT auth not configured".into()))?;
        let claims = jwt::verify_token(secret, bearer)?;

        let user = self
            .source
            .user(&claims.sub)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        Ok(Principal {
            kind: PrincipalKind::Jwt,
            user_id: Some(user.id.clone()),
            team_id: None,
            key_id: None,
            allowed_models: Vec::new(),
            blocked_models: Vec::new(),
            limits: EffectiveLimits {
                tpm: user.tpm.map(|v| v as u32),
                rpm: user.rpm.map(|v| v as u32),
                max_parallel: None,
            },
            is_admin: claims.role == "admin" || user.role == "admin",
        })
    }

    async fn validate_key(&self, bearer: &str) -> Result<Principal, AuthError> {
        let key_hash = hash_credential(bearer);
        let Some(key) = self.source.key_by_hash(&key_hash).await? else {
            warn!(prefix = %crate::keys::key_prefix(&key_hash), "unknown API key");
            return Err(AuthError::Unauthorized);
        };

        let now = Utc::now();
        if key.is_expired(now) || key.is_revoked() {
            return Err(AuthError::KeyExpired);
        }
        if key.is_budget_exceeded() {
            return Err(AuthError::BudgetExceeded);
        }

        let user = match &key.user_id {
            Some(id) => self.source.user(id).await?,
            None => None,
        };
        let team = match &key.team_id {
            Some(id) => self.source.team(id).await?,
            None => None,
        };
        let member = match (&key.team_id, &key.user_id) {
            (Some(team_id), Some(user_id)) => self.source.team_member(team_id, user_id).await?,
            _ => None,
        };

        Ok(resolve_principal(key, user.as_ref(), team.as_ref(), member.as_ref()))
    }
}

/// Fold key, member, team, and user settings into a principal.
fn resolve_principal(
    key: KeyRecord,
    user: Option<&UserRecord>,
    team: Option<&TeamRecord>,
    member: Option<&TeamMemberRecord>,
) -> Principal {
    // Precedence: key override > member override > team > user.
    let tpm = key
        .tpm
        .or(member.and_then(|m| m.tpm))
        .or(team.and_then(|t| t.tpm))
        .or(user.and_then(|u| u.tpm));
    let rpm = key
        .rpm
        .or(member.and_then(|m| m.rpm))
        .or(team.and_then(|t| t.rpm))
        .or(user.and_then(|u| u.rpm));
    let max_parallel = key.max_parallel.or(team.and_then(|t| t.max_parallel));

    // Key allowlist wins outright when present; blocklists union.
    let allowed_models = if !key.allowed_models.is_empty() {
        key.allowed_models.clone()
    } else {
        team.map(|t| t.allowed_models.clone()).unwrap_or_default()
    };
    let mut blocked_models = key.blocked_models.clone();
    if let Some(t) = team {
        for model in &t.blocked_models {
            if !blocked_models.contains(model) {
                blocked_models.push(model.clone());
            }
        }
    }

    let kind = if key.key_type == "system" { PrincipalKind::System } else { PrincipalKind::Key };

    Principal {
        kind,
        user_id: key.user_id,
        team_id: key.team_id,
        key_id: Some(key.id),
        allowed_models,
        blocked_models,
        limits: EffectiveLimits {
            tpm: tpm.map(|v| v as u32),
            rpm: rpm.map(|v| v as u32),
            max_parallel: max_parallel.map(|v| v as u32),
        },
        is_admin: user.is_some_and(|u| u.role == "admin"),
    }
}
