//! Lobby server entry point.
//!
//! Starts the chat and board hub with:
//! - Structured JSON logging
//! - Optional SQLite persistence
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Background purge of expired registration tickets
//!
//! # Example
//!
//! ```bash
//! # Memory-only
//! cargo run --bin lobby-server
//!
//! # Persistent
//! LOBBY_DATABASE_PATH=lobby.db PORT=8080 cargo run --release --bin lobby-server
//! ```
//!
//! See [`lobby_server::config`] for all variables.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use lobby_server::config::Config;
use lobby_server::routes::{create_router, AppState};
use lobby_server::store::sqlite::SqliteStore;
use lobby_server::store::DurableStore;

/// How often expired registration tickets are purged.
const TICKET_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                   - HTTP server port (default: 8080)");
            eprintln!("  LOBBY_DATABASE_PATH    - SQLite file (default: memory only)");
            eprintln!("  LOBBY_ASSETS_DIR       - Static assets (default: static/assets)");
            eprintln!("  LOBBY_HISTORY_LIMIT    - Chat replay size (default: 100)");
            eprintln!("  LOBBY_OUTBOX_CAPACITY  - Per-connection queue (default: 512)");
            eprintln!("  LOBBY_TICKET_TTL_SECS  - Registration ticket lifetime (default: 300)");
            eprintln!("  RUST_LOG               - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    let durable = match open_durable(&config) {
        Ok(durable) => durable,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Failed to open database");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        persistent = durable.is_some(),
        history_limit = config.history_limit,
        "Lobby server starting"
    );

    let state = AppState::new(config.clone(), durable).await;

    let cleanup_handle = state.tickets.spawn_cleanup_task(TICKET_CLEANUP_INTERVAL);
    info!(
        interval_secs = TICKET_CLEANUP_INTERVAL.as_secs(),
        "Ticket cleanup task started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    // Peer addresses feed ticket binding when no proxy header is present.
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    cleanup_handle.abort();
    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Opens the SQLite store when a database path is configured.
fn open_durable(config: &Config) -> anyhow::Result<Option<Arc<dyn DurableStore>>> {
    let Some(path) = &config.database_path else {
        return Ok(None);
    };
    let store = SqliteStore::open(path)
        .with_context(|| format!("opening database at {}", path.display()))?;
    info!(path = %path.display(), "Opened SQLite store");
    Ok(Some(Arc::new(store)))
}

/// JSON logs filtered by `RUST_LOG`, defaulting to `info` with request
/// tracing at `debug`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
///
/// A handler that fails to install is logged and never fires; the other one
/// still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
