//! Credential store adapter: durable store first, in-memory map as fallback.
//!
//! Every operation consults the optional [`DurableStore`] and falls back to
//! process-local maps according to a named [`WritePolicy`]:
//!
//! | Operation | Durable failure |
//! |-----------|-----------------|
//! | `create_user` | [`WritePolicy::Strict`] by default: the request fails |
//! | `set_session_token` / `clear_session_token` | [`WritePolicy::Degrade`] by default: logged, memory updated |
//! | reads | always fall back to memory on "not found" or backend error |
//!
//! Without a durable store the in-memory maps are the only source of truth.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{DurableStore, StoreError};

/// What to do when a durable write fails for a reason other than a
/// uniqueness conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Fail the operation; the write must land durably.
    Strict,
    /// Log the failure and apply the write to the in-memory side instead.
    Degrade,
}

/// Per-operation write policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub create_user: WritePolicy,
    pub session_token: WritePolicy,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            create_user: WritePolicy::Strict,
            session_token: WritePolicy::Degrade,
        }
    }
}

/// Errors surfaced by the credential adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The username is already registered.
    #[error("user already exists")]
    AlreadyExists,

    /// The durable store failed under a strict write policy.
    #[error("credential store failure: {0}")]
    Store(String),
}

#[derive(Debug, Default)]
struct MemoryTokens {
    by_token: HashMap<String, String>,
    by_user: HashMap<String, String>,
}

impl MemoryTokens {
    fn set(&mut self, username: &str, token: &str) {
        self.clear(username);
        self.by_token.insert(token.to_string(), username.to_string());
        self.by_user.insert(username.to_string(), token.to_string());
    }

    fn clear(&mut self, username: &str) {
        if let Some(old) = self.by_user.remove(username) {
            self.by_token.remove(&old);
        }
    }
}

/// Facade over "durable store or in-memory map" for accounts and sessions.
pub struct CredentialStore {
    durable: Option<Arc<dyn DurableStore>>,
    policy: CredentialPolicy,
    users: RwLock<HashMap<String, String>>,
    tokens: RwLock<MemoryTokens>,
}

impl CredentialStore {
    /// Creates an adapter over an optional durable store with default policies.
    pub fn new(durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self::with_policy(durable, CredentialPolicy::default())
    }

    /// Creates an adapter with explicit write policies.
    pub fn with_policy(durable: Option<Arc<dyn DurableStore>>, policy: CredentialPolicy) -> Self {
        Self {
            durable,
            policy,
            users: RwLock::new(HashMap::new()),
            tokens: RwLock::new(MemoryTokens::default()),
        }
    }

    /// Creates an adapter with no durable store.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Returns true when a durable store is configured.
    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// The active write policies.
    pub fn policy(&self) -> CredentialPolicy {
        self.policy
    }

    /// Registers a new account. The caller must pass an already-hashed password.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::AlreadyExists`] if either side already holds the username
    /// - [`CredentialError::Store`] if the durable insert fails under [`WritePolicy::Strict`]
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<(), CredentialError> {
        if self.read_users().contains_key(username) {
            return Err(CredentialError::AlreadyExists);
        }

        if let Some(durable) = &self.durable {
            match durable.insert_user(username, password_hash).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Duplicate) => return Err(CredentialError::AlreadyExists),
                Err(err) => {
                    warn!(username = %username, error = %err, "Durable account insert failed");
                    if self.policy.create_user == WritePolicy::Strict {
                        return Err(CredentialError::Store(err.to_string()));
                    }
                }
            }
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Err(CredentialError::AlreadyExists);
        }
        users.insert(username.to_string(), password_hash.to_string());
        debug!(username = %username, "Account stored in memory");
        Ok(())
    }

    /// Looks up the stored password hash for `username`.
    pub async fn get_user(&self, username: &str) -> Option<String> {
        if let Some(durable) = &self.durable {
            match durable.password_hash(username).await {
                Ok(hash) => return Some(hash),
                Err(StoreError::NotFound) => {}
                Err(err) => {
                    warn!(username = %username, error = %err, "Durable account read failed, using memory");
                }
            }
        }
        self.read_users().get(username).cloned()
    }

    /// Records `token` as the active session of `username`, replacing any
    /// previous token.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] only under a strict session-token policy.
    pub async fn set_session_token(&self, username: &str, token: &str) -> Result<(), CredentialError> {
        if let Some(durable) = &self.durable {
            match durable.set_token(username, Some(token)).await {
                Ok(()) => {
                    // The durable copy is now authoritative for this user.
                    self.write_tokens().clear(username);
                    return Ok(());
                }
                Err(StoreError::NotFound) => {
                    debug!(username = %username, "Account not in durable store, token kept in memory");
                }
                Err(err) => {
                    warn!(username = %username, error = %err, "Durable token write failed");
                    if self.policy.session_token == WritePolicy::Strict {
                        return Err(CredentialError::Store(err.to_string()));
                    }
                }
            }
        }

        self.write_tokens().set(username, token);
        Ok(())
    }

    /// Removes the session token of `username` from both sides.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] only under a strict session-token
    /// policy; the in-memory token is cleared regardless.
    pub async fn clear_session_token(&self, username: &str) -> Result<(), CredentialError> {
        self.write_tokens().clear(username);

        if let Some(durable) = &self.durable {
            match durable.set_token(username, None).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => {
                    warn!(username = %username, error = %err, "Durable token clear failed");
                    if self.policy.session_token == WritePolicy::Strict {
                        return Err(CredentialError::Store(err.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves a session token to a username.
    pub async fn username_for_token(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        if let Some(durable) = &self.durable {
            match durable.username_for_token(token).await {
                Ok(username) => return Some(username),
                Err(StoreError::NotFound) => {
                    debug!("Token not found in durable store, checking memory");
                }
                Err(err) => {
                    warn!(error = %err, "Durable token lookup failed, using memory");
                }
            }
        }
        self.read_tokens().by_token.get(token).cloned()
    }

    /// All usernames currently holding a non-empty session token.
    ///
    /// Durable holders are listed when the store is reachable; holders whose
    /// token only landed in memory are always included.
    pub async fn online_usernames(&self) -> BTreeSet<String> {
        let mut online = BTreeSet::new();
        if let Some(durable) = &self.durable {
            match durable.online_usernames().await {
                Ok(names) => online.extend(names),
                Err(err) => warn!(error = %err, "Durable online lookup failed, using memory"),
            }
        }
        online.extend(
            self.read_tokens()
                .by_user
                .iter()
                .filter(|(_, token)| !token.is_empty())
                .map(|(name, _)| name.clone()),
        );
        online
    }

    fn read_users(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_tokens(&self) -> std::sync::RwLockReadGuard<'_, MemoryTokens> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tokens(&self) -> std::sync::RwLockWriteGuard<'_, MemoryTokens> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("durable", &self.durable.is_some())
            .field("policy", &self.policy)
            .field("memory_users", &self.read_users().len())
            .finish()
    }
}
