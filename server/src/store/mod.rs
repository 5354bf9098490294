//! Durable storage collaborator.
//!
//! [`DurableStore`] is the narrow interface the credential adapter and the
//! chat hub consume. Implementations must keep "not found" distinguishable
//! from a backend failure, because callers fall back to in-memory state on
//! the latter but treat the former as an answer.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::ChatMessage;

pub use sqlite::SqliteStore;

/// Errors reported by a durable store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("record not found")]
    NotFound,

    /// A uniqueness constraint rejected the write.
    #[error("record already exists")]
    Duplicate,

    /// The backend failed (I/O, locking, connectivity).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a backend error from any displayable failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Persistent backing store for accounts, session tokens, and chat history.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts a new account. Fails with [`StoreError::Duplicate`] if the
    /// username is taken.
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<(), StoreError>;

    /// Returns the stored password hash for `username`.
    async fn password_hash(&self, username: &str) -> Result<String, StoreError>;

    /// Sets (or clears, with `None`) the session token on an account.
    /// Fails with [`StoreError::NotFound`] if the account does not exist.
    async fn set_token(&self, username: &str, token: Option<&str>) -> Result<(), StoreError>;

    /// Resolves a session token to its account.
    async fn username_for_token(&self, token: &str) -> Result<String, StoreError>;

    /// Usernames of all accounts holding a non-empty session token.
    async fn online_usernames(&self) -> Result<Vec<String>, StoreError>;

    /// The most recent `limit` chat messages, newest first.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    /// Appends a chat message.
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A durable store that can be switched into a failing state.

    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    pub(crate) struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                failing: AtomicBool::new(false),
            }
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::backend("simulated outage"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn insert_user(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.insert_user(username, password_hash).await
        }

        async fn password_hash(&self, username: &str) -> Result<String, StoreError> {
            self.check()?;
            self.inner.password_hash(username).await
        }

        async fn set_token(&self, username: &str, token: Option<&str>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set_token(username, token).await
        }

        async fn username_for_token(&self, token: &str) -> Result<String, StoreError> {
            self.check()?;
            self.inner.username_for_token(token).await
        }

        async fn online_usernames(&self) -> Result<Vec<String>, StoreError> {
            self.check()?;
            self.inner.online_usernames().await
        }

        async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
            self.check()?;
            self.inner.recent_messages(limit).await
        }

        async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
            self.check()?;
            self.inner.insert_message(message).await
        }
    }
}
