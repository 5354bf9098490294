//! Unguessable token generation for sessions and registration tickets.
//!
//! All randomness is drawn from the operating system's CSPRNG. If the
//! entropy source reports an error the caller gets a [`TokenError`]; there is
//! no fallback to a weaker generator.
//!
//! # Token Formats
//!
//! - Session tokens: 32 random bytes, base64-url encoded without padding
//!   (43 characters, fits a 50-character text column).
//! - Registration tickets: 16 random bytes, hex encoded (32 characters).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::TryRngCore;
use thiserror::Error;

/// Number of random bytes in a session token.
pub const SESSION_TOKEN_BYTES: usize = 32;

/// Encoded length of a session token.
pub const SESSION_TOKEN_LENGTH: usize = 43;

/// Number of random bytes in a registration ticket.
pub const TICKET_TOKEN_BYTES: usize = 16;

/// Errors raised while drawing randomness.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The operating system entropy source failed.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Fills a fresh buffer of `n` bytes from the OS entropy source.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, TokenError> {
    let mut bytes = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| TokenError::Entropy(err.to_string()))?;
    Ok(bytes)
}

/// Returns `n` random bytes encoded as lowercase hex (`2 * n` characters).
pub fn random_hex(n: usize) -> Result<String, TokenError> {
    random_bytes(n).map(hex::encode)
}

/// Returns `n` random bytes encoded as URL-safe base64 without padding.
pub fn random_url_safe_base64(n: usize) -> Result<String, TokenError> {
    random_bytes(n).map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
}

/// Mints a new session token.
///
/// ```rust
/// use lobby_server::token::{session_token, SESSION_TOKEN_LENGTH};
///
/// let token = session_token().expect("entropy available");
/// assert_eq!(token.len(), SESSION_TOKEN_LENGTH);
/// ```
pub fn session_token() -> Result<String, TokenError> {
    random_url_safe_base64(SESSION_TOKEN_BYTES)
}

/// Mints a new registration ticket token.
pub fn registration_token() -> Result<String, TokenError> {
    random_hex(TICKET_TOKEN_BYTES)
}
