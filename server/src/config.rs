//! Server configuration module.
//!
//! Parses configuration from environment variables for the lobby server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `LOBBY_DATABASE_PATH` | No | - | SQLite file; unset runs memory-only |
//! | `LOBBY_ASSETS_DIR` | No | `static/assets` | Directory served under `/assets/` |
//! | `LOBBY_HISTORY_LIMIT` | No | 100 | Chat messages replayed to new clients |
//! | `LOBBY_OUTBOX_CAPACITY` | No | 512 | Per-connection outbound queue (must exceed the history limit) |
//! | `LOBBY_TICKET_TTL_SECS` | No | 300 | Registration ticket lifetime |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::hub::chat::DEFAULT_HISTORY_LIMIT;
use crate::hub::DEFAULT_OUTBOX_CAPACITY;
use crate::tickets::DEFAULT_TICKET_TTL;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default static asset directory.
const DEFAULT_ASSETS_DIR: &str = "static/assets";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// SQLite database file. `None` keeps all state in memory.
    pub database_path: Option<PathBuf>,

    /// Directory served under `/assets/`.
    pub assets_dir: PathBuf,

    /// Number of chat messages replayed to a newly connected client.
    pub history_limit: usize,

    /// Capacity of each connection's outbound queue.
    pub outbox_capacity: usize,

    /// Lifetime of a registration ticket.
    pub ticket_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: None,
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            history_limit: DEFAULT_HISTORY_LIMIT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            ticket_ttl: DEFAULT_TICKET_TTL,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A numeric variable does not parse
    /// - Port number is not a valid u16
    /// - The outbox capacity does not exceed the history limit
    ///
    /// # Example
    ///
    /// ```no_run
    /// use lobby_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let database_path = env::var("LOBBY_DATABASE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let assets_dir = env::var("LOBBY_ASSETS_DIR")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_ASSETS_DIR), PathBuf::from);
        let history_limit = parse_env("LOBBY_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?;
        let outbox_capacity = parse_env("LOBBY_OUTBOX_CAPACITY", DEFAULT_OUTBOX_CAPACITY)?;
        let ticket_ttl_secs = parse_env("LOBBY_TICKET_TTL_SECS", DEFAULT_TICKET_TTL.as_secs())?;

        let config = Self {
            port,
            database_path,
            assets_dir,
            history_limit,
            outbox_capacity,
            ticket_ttl: Duration::from_secs(ticket_ttl_secs),
        };

        config.validate()?;

        if config.database_path.is_none() {
            warn!("LOBBY_DATABASE_PATH is not set - accounts and chat history will not survive a restart");
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// A full history replay must fit in a fresh connection's outbox, and
    /// tickets need a non-zero lifetime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox_capacity <= self.history_limit {
            return Err(ConfigError::ValidationError(format!(
                "LOBBY_OUTBOX_CAPACITY ({}) must be greater than LOBBY_HISTORY_LIMIT ({})",
                self.outbox_capacity, self.history_limit
            )));
        }

        if self.ticket_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "LOBBY_TICKET_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a numeric environment variable, falling back to `default` when unset.
fn parse_env<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidFormat {
            var: var.to_string(),
            message: format!("'{}': {}", raw, err),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: var.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: [&str; 6] = [
        "PORT",
        "LOBBY_DATABASE_PATH",
        "LOBBY_ASSETS_DIR",
        "LOBBY_HISTORY_LIMIT",
        "LOBBY_OUTBOX_CAPACITY",
        "LOBBY_TICKET_TTL_SECS",
    ];

    /// Restores every touched variable on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Starts from a clean slate for every variable the config reads.
        fn clean() -> Self {
            let mut guard = Self::new();
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        let _guard = EnvGuard::clean();

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.database_path.is_none());
        assert_eq!(config.assets_dir, PathBuf::from("static/assets"));
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.outbox_capacity, 512);
        assert_eq!(config.ticket_ttl, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_config_all_set() {
        let mut guard = EnvGuard::clean();
        guard.set("PORT", "9090");
        guard.set("LOBBY_DATABASE_PATH", "/tmp/lobby.db");
        guard.set("LOBBY_ASSETS_DIR", "public");
        guard.set("LOBBY_HISTORY_LIMIT", "20");
        guard.set("LOBBY_OUTBOX_CAPACITY", "64");
        guard.set("LOBBY_TICKET_TTL_SECS", "60");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, 9090);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/lobby.db")));
        assert_eq!(config.assets_dir, PathBuf::from("public"));
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.outbox_capacity, 64);
        assert_eq!(config.ticket_ttl, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_empty_database_path_means_memory_only() {
        let mut guard = EnvGuard::clean();
        guard.set("LOBBY_DATABASE_PATH", "  ");

        let config = Config::from_env().expect("should parse config");
        assert!(config.database_path.is_none());
    }

    #[test]
    #[serial]
    fn test_outbox_must_exceed_history_limit() {
        let mut guard = EnvGuard::clean();
        guard.set("LOBBY_HISTORY_LIMIT", "100");
        guard.set("LOBBY_OUTBOX_CAPACITY", "100");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn test_zero_ticket_ttl_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("LOBBY_TICKET_TTL_SECS", "0");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_number() {
        let mut guard = EnvGuard::clean();
        guard.set("LOBBY_HISTORY_LIMIT", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "LOBBY_HISTORY_LIMIT")
        );
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    #[serial]
    fn test_port_values() {
        let mut guard = EnvGuard::clean();
        assert_eq!(parse_port().unwrap(), 8080);

        guard.set("PORT", "3000");
        assert_eq!(parse_port().unwrap(), 3000);

        for bad in ["not-a-number", "99999", "-1"] {
            guard.set("PORT", bad);
            assert!(
                matches!(parse_port(), Err(ConfigError::InvalidPort(_))),
                "PORT={bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_default_impl_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
