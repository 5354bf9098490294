//! Password hashing capability and credential policy.
//!
//! The rest of the server treats hashing as an opaque [`PasswordScheme`]:
//! plaintext goes in, a self-describing hash string comes out, and only the
//! scheme knows how to verify it again. The default scheme is Argon2id.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

use crate::token::{random_bytes, TokenError};

/// Minimum accepted password length.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Salt size in bytes.
const SALT_BYTES: usize = 16;

/// Errors produced while validating or hashing passwords.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PasswordError {
    /// The username was empty.
    #[error("username cannot be empty")]
    EmptyUsername,

    /// The password was shorter than [`MIN_PASSWORD_LENGTH`].
    #[error("password must be at least 6 characters")]
    TooShort,

    /// Salt generation failed.
    #[error(transparent)]
    Entropy(#[from] TokenError),

    /// The hashing primitive rejected its input.
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Opaque hash/verify capability.
pub trait PasswordScheme: Send + Sync {
    /// Hashes a plaintext password into a storable string.
    fn hash(&self, password: &str) -> Result<String, PasswordError>;

    /// Returns true when `password` matches `hash`. Malformed hashes never match.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Argon2id hashing with configurable cost.
#[derive(Debug, Clone)]
pub struct Argon2Scheme {
    params: Params,
}

impl Argon2Scheme {
    /// Creates a scheme with the library's recommended parameters.
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Creates a scheme with explicit cost parameters.
    ///
    /// Low costs are only appropriate for tests.
    pub fn with_params(params: Params) -> Self {
        Self { params }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Scheme {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordScheme for Argon2Scheme {
    fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt_bytes = random_bytes(SALT_BYTES)?;
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|err| PasswordError::Hashing(err.to_string()))?;
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| PasswordError::Hashing(err.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

/// Checks that a username is usable.
pub fn validate_username(username: &str) -> Result<(), PasswordError> {
    if username.trim().is_empty() {
        return Err(PasswordError::EmptyUsername);
    }
    Ok(())
}

/// Checks the password policy.
pub fn validate_password(password: &str) -> Result<(), PasswordError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PasswordError::TooShort);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn fast_scheme() -> Argon2Scheme {
    Argon2Scheme::with_params(Params::new(8, 1, 1, None).unwrap())
}
