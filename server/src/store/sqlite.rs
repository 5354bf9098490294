//! SQLite implementation of [`DurableStore`].
//!
//! rusqlite is synchronous, so the connection sits behind an
//! `Arc<Mutex<_>>` and every call runs on tokio's blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use super::{DurableStore, StoreError};
use crate::types::{utc_timestamp, ChatMessage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    username        TEXT PRIMARY KEY NOT NULL,
    password_hash   TEXT NOT NULL,
    account_token   TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_accounts_token ON accounts(account_token);
CREATE TABLE IF NOT EXISTS chat_messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_token   TEXT NULL,
    username        TEXT NULL,
    message         TEXT NOT NULL,
    chat_date       TEXT NOT NULL
);
";

/// Durable store backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::backend)?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "Durable store opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(StoreError::backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard)
        })
        .await
        .map_err(StoreError::backend)?
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        self.run(move |conn| {
            match conn.execute(
                "INSERT INTO accounts (username, password_hash, account_token) VALUES (?1, ?2, NULL)",
                params![username, password_hash],
            ) {
                Ok(_) => {
                    debug!(username = %username, "Inserted account");
                    Ok(())
                }
                Err(err) if is_constraint_violation(&err) => Err(StoreError::Duplicate),
                Err(err) => Err(StoreError::backend(err)),
            }
        })
        .await
    }

    async fn password_hash(&self, username: &str) -> Result<String, StoreError> {
        let username = username.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT password_hash FROM accounts WHERE username = ?1",
                params![username],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::backend)?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn set_token(&self, username: &str, token: Option<&str>) -> Result<(), StoreError> {
        let username = username.to_string();
        let token = token.map(str::to_string);
        self.run(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE accounts SET account_token = ?1 WHERE username = ?2",
                    params![token, username],
                )
                .map_err(StoreError::backend)?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn username_for_token(&self, token: &str) -> Result<String, StoreError> {
        if token.is_empty() {
            return Err(StoreError::NotFound);
        }
        let token = token.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT username FROM accounts WHERE account_token = ?1",
                params![token],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::backend)?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn online_usernames(&self) -> Result<Vec<String>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT username FROM accounts \
                     WHERE account_token IS NOT NULL AND account_token != '' \
                     ORDER BY username",
                )
                .map_err(StoreError::backend)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StoreError::backend)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::backend)
        })
        .await
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT account_token, username, message, chat_date FROM chat_messages \
                     ORDER BY id DESC LIMIT ?1",
                )
                .map_err(StoreError::backend)?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(ChatMessage {
                        account_token: row.get(0)?,
                        username: row.get(1)?,
                        message: row.get(2)?,
                        time: Some(row.get::<_, String>(3)?),
                    })
                })
                .map_err(StoreError::backend)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::backend)
        })
        .await
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let message = message.clone();
        self.run(move |conn| {
            let chat_date = message.time.clone().unwrap_or_else(utc_timestamp);
            conn.execute(
                "INSERT INTO chat_messages (account_token, username, message, chat_date) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.account_token,
                    message.username,
                    message.message,
                    chat_date
                ],
            )
            .map_err(StoreError::backend)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn insert_and_read_user() {
        let store = store();
        store.insert_user("alice", "hash-a").await.unwrap();

        assert_eq!(store.password_hash("alice").await.unwrap(), "hash-a");
        assert_eq!(
            store.password_hash("bob").await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn duplicate_user_is_reported() {
        let store = store();
        store.insert_user("alice", "hash-a").await.unwrap();

        assert_eq!(
            store.insert_user("alice", "hash-b").await,
            Err(StoreError::Duplicate)
        );
        assert_eq!(store.password_hash("alice").await.unwrap(), "hash-a");
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let store = store();
        store.insert_user("alice", "h").await.unwrap();

        store.set_token("alice", Some("tok-1")).await.unwrap();
        assert_eq!(store.username_for_token("tok-1").await.unwrap(), "alice");

        store.set_token("alice", Some("tok-2")).await.unwrap();
        assert_eq!(
            store.username_for_token("tok-1").await,
            Err(StoreError::NotFound)
        );
        assert_eq!(store.username_for_token("tok-2").await.unwrap(), "alice");

        store.set_token("alice", None).await.unwrap();
        assert_eq!(
            store.username_for_token("tok-2").await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn set_token_for_missing_account_is_not_found() {
        let store = store();
        assert_eq!(
            store.set_token("ghost", Some("t")).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn empty_token_never_resolves() {
        let store = store();
        store.insert_user("alice", "h").await.unwrap();
        store.set_token("alice", Some("")).await.unwrap();

        assert_eq!(store.username_for_token("").await, Err(StoreError::NotFound));
        assert!(store.online_usernames().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn online_usernames_lists_token_holders() {
        let store = store();
        for name in ["carol", "alice", "bob"] {
            store.insert_user(name, "h").await.unwrap();
        }
        store.set_token("carol", Some("c")).await.unwrap();
        store.set_token("alice", Some("a")).await.unwrap();

        assert_eq!(store.online_usernames().await.unwrap(), vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn recent_messages_are_newest_first_and_limited() {
        let store = store();
        for i in 1..=5 {
            let mut msg = ChatMessage::text(format!("m{i}"));
            msg.username = Some("alice".to_string());
            msg.time = Some(format!("2024-01-01T00:00:0{i}Z"));
            store.insert_message(&msg).await.unwrap();
        }

        let recent = store.recent_messages(3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["m5", "m4", "m3"]);
        assert_eq!(recent[0].time.as_deref(), Some("2024-01-01T00:00:05Z"));
    }

    #[tokio::test]
    async fn message_without_time_is_stamped() {
        let store = store();
        store.insert_message(&ChatMessage::text("hello")).await.unwrap();

        let recent = store.recent_messages(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].time.is_some());
    }
}
