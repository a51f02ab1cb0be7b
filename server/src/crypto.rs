//! Cryptographic utilities for SkillSwap Server
//!
//! Only access keys and bearer tokens; both are stored as SHA-256 hashes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::{
    digest,
    error::Unspecified,
    rand::{SecureRandom, SystemRandom},
};

const ACCESS_KEY_LENGTH: usize = 32;
const SESSION_TOKEN_LENGTH: usize = 32;

fn random_token(len: usize) -> Result<String, Unspecified> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a random access key (base64url, 32 bytes)
pub fn generate_access_key() -> anyhow::Result<String> {
    random_token(ACCESS_KEY_LENGTH).map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))
}

/// Generate a bearer token
pub fn generate_session_token() -> anyhow::Result<String> {
    random_token(SESSION_TOKEN_LENGTH).map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))
}

/// SHA-256 hex digest, used for access keys and tokens alike
pub fn hash_secret(secret: &str) -> String {
    let hash = digest::digest(&digest::SHA256, secret.as_bytes());
    hex::encode(hash.as_ref())
}

/// Verify a secret against a stored hash
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    let computed_hash = hash_secret(secret);
    if computed_hash.len() != hash.len() {
        return false;
    }
    computed_hash
        .as_bytes()
        .iter()
        .zip(hash.as_bytes().iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_key_verification() {
        let key = generate_access_key().unwrap();
        let hash = hash_secret(&key);

        assert!(verify_secret(&key, &hash));
        assert!(!verify_secret("wrong-key", &hash));
        assert!(!verify_secret(&key, "short"));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = generate_session_token().unwrap();
        let b = generate_session_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
    }
}
