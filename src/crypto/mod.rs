//! Cryptography Module - fragment sealing and credential handling
//!
//! Provides AES-256-GCM sealing of stored fragments under a rotating key ring,
//! BLAKE3 content hashing for integrity checks, and Argon2id password hashes
//! for password-protected files.

pub mod encryption;
mod hashing;

pub use encryption::{EncryptionKey, KeyId, KeyRing};
pub use hashing::ContentHash;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown key id {0}")]
    UnknownKey(KeyId),

    #[error("Key {0} is still active and cannot be retired")]
    KeyInUse(KeyId),
}

/// Secure random bytes generator
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Hash a file password into a PHC string using Argon2id
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD_NO_PAD,
        random_bytes(16),
    );
    let salt = SaltString::from_b64(&salt_b64).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Check a password against a PHC string produced by [`hash_password`]
pub fn verify_password(password: &str, phc: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use argon2::Argon2;

    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let bytes1 = random_bytes(32);
        let bytes2 = random_bytes(32);

        assert_eq!(bytes1.len(), 32);
        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let phc = hash_password("correct horse").unwrap();

        assert!(phc.starts_with("$argon2"));
        assert!(verify_password("correct horse", &phc));
        assert!(!verify_password("battery staple", &phc));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
