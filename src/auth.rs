use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Generate an opaque operator token.
/// Only its hash goes into the environment (`ADMIN_TOKEN_SHA256`).
#[allow(dead_code)] // called from the gentoken binary
pub fn generate_operator_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex of a token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares a presented token against the configured hash without
/// short-circuiting on the first differing byte.
pub fn token_matches(token: &str, expected_sha256_hex: &str) -> bool {
    let actual = hash_token(token);
    let (a, b) = (actual.as_bytes(), expected_sha256_hex.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_and_url_safe() {
        let a = generate_operator_token();
        let b = generate_operator_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_token_matches_hash() {
        let token = generate_operator_token();
        let hash = hash_token(&token);
        assert_eq!(hash.len(), 64);
        assert!(token_matches(&token, &hash));
        assert!(!token_matches("wrong", &hash));
        assert!(!token_matches(&token, "abc"));
    }
}
