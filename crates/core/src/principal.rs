//! The authenticated caller and their effective limits.
//!
//! A [`Principal`] is produced by the auth layer once per request and
//! carried through the middleware chain. It folds key, team-member, team,
//! and user settings into one resolved view so downstream components
//! never re-derive precedence.

use serde::{Deserialize, Serialize};

/// What kind of credential produced this principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// The configured master key. Bypasses budget and most limits.
    Master,
    /// A UI session token (JWT).
    Jwt,
    /// An API or virtual key.
    Key,
    /// A system key owned by neither user nor team.
    System,
}

/// Resolved per-principal limits.
///
/// Precedence already applied: key override > team-member override >
/// team default > user default. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub tpm: Option<u32>,
    pub rpm: Option<u32>,
    pub max_parallel: Option<u32>,
}

/// The authenticated caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// Empty means every model is allowed (unless blocked).
    #[serde(default)]
    pub allowed_models: Vec<String>,

    #[serde(default)]
    pub blocked_models: Vec<String>,

    #[serde(default)]
    pub limits: EffectiveLimits,

    /// Derived from the owning user's role (or master). Gates `/admin`.
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    /// The master principal: no owner, no limits, no allowlist.
    pub fn master() -> Self {
        Self {
            kind: PrincipalKind::Master,
            user_id: None,
            team_id: None,
            key_id: None,
            allowed_models: Vec::new(),
            blocked_models: Vec::new(),
            limits: EffectiveLimits::default(),
            is_admin: true,
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind == PrincipalKind::Master
    }

    /// Model access check. Blocked always dominates allowed, including
    /// the `"*"` wildcard; an empty allowlist admits everything.
    pub fn is_model_allowed(&self, model: &str) -> bool {
        let blocked = self
            .blocked_models
            .iter()
            .any(|b| b == model || b == "*");
        if blocked {
            return false;
        }
        self.allowed_models.is_empty()
            || self.allowed_models.iter().any(|a| a == model || a == "*")
    }

    /// The rate-limit key for this principal: key id when present,
    /// otherwise the caller falls back to client IP.
    pub fn rate_limit_key(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// The budget entity this principal is charged to, most specific
    /// first: key, then team, then user.
    pub fn budget_entities(&self) -> Vec<(&'static str, &str)> {
        let mut entities = Vec::new();
        if let Some(key_id) = &self.key_id {
            entities.push(("key", key_id.as_str()));
        }
        // System keys answer only to their own key budget.
        if self.kind != PrincipalKind::System {
            if let Some(team_id) = &self.team_id {
                entities.push(("team", team_id.as_str()));
            }
            if let Some(user_id) = &self.user_id {
                entities.push(("user", user_id.as_str()));
            }
        }
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_principal(allowed: &[&str], blocked: &[&str]) -> Principal {
        Principal {
            kind: PrincipalKind::Key,
            user_id: Some("u1".into()),
            team_id: None,
            key_id: Some("k1".into()),
            allowed_models: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_models: blocked.iter().map(|s| s.to_string()).collect(),
            limits: EffectiveLimits::default(),
            is_admin: false,
        }
    }

    #[test]
    fn empty_allowlist_admits_everything() {
        let p = key_principal(&[], &[]);
        assert!(p.is_model_allowed("gpt-4"));
        assert!(p.is_model_allowed("claude-3-opus"));
    }

    #[test]
    fn allowlist_restricts() {
        let p = key_principal(&["gpt-3.5-turbo"], &[]);
        assert!(p.is_model_allowed("gpt-3.5-turbo"));
        assert!(!p.is_model_allowed("gpt-4"));
    }

    #[test]
    fn wildcard_allow() {
        let p = key_principal(&["*"], &[]);
        assert!(p.is_model_allowed("anything"));
    }

    #[test]
    fn blocked_dominates_allowed() {
        let p = key_principal(&["gpt-4"], &["gpt-4"]);
        assert!(!p.is_model_allowed("gpt-4"));
    }

    #[test]
    fn wildcard_block_dominates_everything() {
        let p = key_principal(&["gpt-4", "*"], &["*"]);
        assert!(!p.is_model_allowed("gpt-4"));
        assert!(!p.is_model_allowed("gpt-3.5-turbo"));
    }

    #[test]
    fn master_bypasses_allowlist() {
        let p = Principal::master();
        assert!(p.is_master());
        assert!(p.is_model_allowed("anything"));
        assert!(p.budget_entities().is_empty());
    }

    #[test]
    fn budget_entities_most_specific_first() {
        let p = Principal {
            kind: PrincipalKind::Key,
            user_id: Some("u1".into()),
            team_id: Some("t1".into()),
            key_id: Some("k1".into()),
            allowed_models: vec![],
            blocked_models: vec![],
            limits: EffectiveLimits::default(),
            is_admin: false,
        };
        assert_eq!(p.budget_entities(), vec![("key", "k1"), ("team", "t1"), ("user", "u1")]);
    }

    #[test]
    fn system_key_skips_owner_budgets() {
        let p = Principal {
            kind: PrincipalKind::System,
            user_id: None,
            team_id: None,
            key_id: Some("sys1".into()),
            allowed_models: vec![],
            blocked_models: vec![],
            limits: EffectiveLimits::default(),
            is_admin: false,
        };
        assert_eq!(p.budget_entities(), vec![("key", "sys1")]);
    }
}
