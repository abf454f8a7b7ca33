//! Pluggable one-way password hashing.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// One-way hash used to store and check passwords.
pub trait PasswordHasher: Send + Sync {
    /// Hash a plaintext password for storage.
    fn hash(&self, password: &str) -> String;

    /// Check a plaintext password against a stored hash.
    fn verify(&self, password: &str, stored: &str) -> bool {
        constant_time_eq(&self.hash(password), stored)
    }
}

/// SHA-256 of the UTF-8 password, base64-encoded.
///
/// Matches the format of existing account rows. Unsalted, so only suitable
/// where the store format cannot change yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl PasswordHasher for Sha256Hasher {
    fn hash(&self, password: &str) -> String {
        sha256_b64(password.as_bytes())
    }
}

/// Compute SHA-256 of `bytes` and return the base64-encoded result.
pub fn sha256_b64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// Compare two strings without early exit on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
