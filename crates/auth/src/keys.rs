//! Key material helpers: hashing, prefixes, generation, shape checks.
//!
//! Plaintext keys exist only in transit; storage sees the SHA-256 hash
//! and an 8-character prefix used for display and log correlation.

use sha2::{Digest, Sha256};

/// Bearer prefixes this gateway recognizes as key-shaped.
const KEY_PREFIXES: &[&str] = &[
    "sk-api-", "sk-vrt-", "sk-mst-", "sk-sys-", "pllm_ak_", "pllm_mk_", "pllm_sk_", "sk-",
];

/// SHA-256 of the plaintext, lowercase hex. The stored lookup key.
pub fn hash_credential(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// First 8 hex chars of the hash — safe to log and display.
pub fn key_prefix(key_hash: &str) -> String {
    key_hash.chars().take(8).collect()
}

/// Generate a fresh API key. Returned exactly once; only the hash is
/// stored.
pub fn generate_api_key() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..48)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("sk-api-{suffix}")
}

/// Three dot-separated non-empty segments — the JWT wire shape.
pub fn looks_like_jwt(bearer: &str) -> bool {
    let segments: Vec<&str> = bearer.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.is_empty())
}

/// Does the bearer carry one of the recognized key prefixes?
pub fn has_key_prefix(bearer: &str) -> bool {
    KEY_PREFIXES.iter().any(|p| bearer.starts_with(p))
}
