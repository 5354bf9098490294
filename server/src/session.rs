//! In-memory session registry.
//!
//! The registry maps session tokens to usernames and keeps the inverse
//! mapping so that a user holds at most one registry token at a time. Both
//! maps live under one [`RwLock`], so a token replacement is never observed
//! half-applied.
//!
//! The registry is process-local and lost on restart. The session middleware
//! cross-checks it against the [`CredentialStore`](crate::credentials::CredentialStore),
//! which carries the durable copy.
//!
//! # Example
//!
//! ```rust
//! use lobby_server::session::SessionRegistry;
//!
//! let registry = SessionRegistry::new();
//! registry.store("token-a", "alice");
//! assert_eq!(registry.lookup("token-a").as_deref(), Some("alice"));
//!
//! // A new token for the same user replaces the old one.
//! registry.store("token-b", "alice");
//! assert!(registry.lookup("token-a").is_none());
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::trace;

#[derive(Debug, Default)]
struct Maps {
    by_token: HashMap<String, String>,
    by_user: HashMap<String, String>,
}

/// Thread-safe token ⇄ username mapping.
#[derive(Default)]
pub struct SessionRegistry {
    maps: RwLock<Maps>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `token` for `username`, dropping any token the user held before.
    pub fn store(&self, token: &str, username: &str) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(old) = maps.by_user.remove(username) {
            maps.by_token.remove(&old);
            trace!(username = %username, "Replaced previous session token");
        }
        // The token may have belonged to someone else; unlink that user.
        if let Some(previous_owner) = maps.by_token.remove(token) {
            maps.by_user.remove(&previous_owner);
        }

        maps.by_token.insert(token.to_string(), username.to_string());
        maps.by_user.insert(username.to_string(), token.to_string());
    }

    /// Returns the username holding `token`.
    pub fn lookup(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .get(token)
            .cloned()
    }

    /// Removes `token`, returning the username it belonged to.
    pub fn remove(&self, token: &str) -> Option<String> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let username = maps.by_token.remove(token)?;
        if maps.by_user.get(&username).map(String::as_str) == Some(token) {
            maps.by_user.remove(&username);
        }
        trace!(username = %username, "Session removed from registry");
        Some(username)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .len()
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("session_count", &self.len())
            .finish()
    }
}
