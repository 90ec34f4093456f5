//! HS256 session tokens for the UI flow.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pllm_core::error::AuthError;
use serde::{Deserialize, Serialize};

/// Claims carried by a UI session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The user id.
    pub sub: String,
    /// admin | manager | user | viewer
    #[serde(default)]
    pub role: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Issue a token for a user session.
pub fn issue_token(secret: &str, user_id: &str, role: &str, expiry_hours: u64) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: chrono::Utc::now().timestamp() + (expiry_hours as i64) * 3600,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Verify signature and expiry; returns the claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = issue_token("test-secret", "u1", "admin", 1).unwrap();
        let claims = verify_token("test-secret", &token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("secret-a", "u1", "user", 1).unwrap();
        assert!(verify_token("secret-b", &token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let claims = Claims { sub: "u1".into(), role: "user".into(), exp: chrono::Utc::now().timestamp() - 120 };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s"),
        )
        .unwrap();
        assert!(verify_token("s", &token).is_err());
    }
}
