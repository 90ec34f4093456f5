//! Authentication and principal resolution.
//!
//! Turns an opaque bearer credential into a [`Principal`]: master-key
//! constant-time fast path, JWT verification for the UI flow, and
//! SHA-256 key lookup with effective-limit precedence for API keys.

pub mod jwt;
pub mod keys;
pub mod resolver;

pub use jwt::{Claims, issue_token, verify_token};
pub use keys::{generate_api_key, hash_credential, key_prefix, looks_like_jwt};
pub use resolver::{Authenticator, CredentialSource};
