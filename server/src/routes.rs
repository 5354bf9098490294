//! HTTP route handlers for the lobby server.
//!
//! # Public
//!
//! - `GET /`, `GET /login` - Login page
//! - `POST /login` - Password login, sets the session cookie
//! - `GET /register` - Registration page carrying a fresh ticket
//! - `POST /register` - Ticket redemption and account creation
//! - `GET|POST /logout` - Ends the session
//! - `GET /health` - Health check
//! - `/assets/*` - Static files
//!
//! # Session required
//!
//! - `GET /me`, `GET /online` - Current user and online users
//! - `GET /lobby`, `GET /board` - Pages
//! - `GET /chat/history` - Recent chat messages
//! - `GET /ws/chat`, `GET /ws/board` - WebSocket endpoints
//! - `GET /turn`, `POST /move` - Board game
//!
//! # Example
//!
//! ```rust,no_run
//! use lobby_server::config::Config;
//! use lobby_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::new(Config::default(), None).await;
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{FormRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{AppError, AuthError};
use crate::hub::chat::ChatHubConfig;
use crate::hub::{encode, BoardHub, ChatHub, Connection, ConnectionGuard, Frame, Reply};
use crate::middleware::{require_session, CurrentUser, SESSION_COOKIE};
use crate::pages;
use crate::password::{validate_password, validate_username, Argon2Scheme, PasswordScheme};
use crate::session::SessionRegistry;
use crate::store::DurableStore;
use crate::tickets::{ClientInfo, TicketBook};
use crate::token::session_token;
use crate::types::{ChatMessage, LoginForm, MoveRequest, RegistrationForm};

/// Session cookie lifetime (7 days).
const SESSION_MAX_AGE_DAYS: i64 = 7;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Accounts and durable session tokens.
    pub credentials: Arc<CredentialStore>,

    /// In-memory session registry.
    pub sessions: Arc<SessionRegistry>,

    /// Outstanding registration tickets.
    pub tickets: TicketBook,

    /// Chat hub handle.
    pub chat: ChatHub,

    /// Board hub handle.
    pub board: BoardHub,

    /// Password hashing capability.
    pub hasher: Arc<dyn PasswordScheme>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the state and starts both hubs.
    ///
    /// `durable` backs accounts, session tokens and chat history; `None` keeps
    /// everything in memory.
    pub async fn new(config: Config, durable: Option<Arc<dyn DurableStore>>) -> Self {
        let credentials = CredentialStore::new(durable.clone());
        let chat = ChatHub::spawn(
            durable,
            ChatHubConfig {
                history_limit: config.history_limit,
                ..ChatHubConfig::default()
            },
        )
        .await;
        Self::with_components(
            config,
            credentials,
            chat,
            BoardHub::spawn(),
            Arc::new(Argon2Scheme::new()),
        )
    }

    /// Builds the state from explicit components.
    ///
    /// Useful for testing with a cheap password scheme or a custom store.
    pub fn with_components(
        config: Config,
        credentials: CredentialStore,
        chat: ChatHub,
        board: BoardHub,
        hasher: Arc<dyn PasswordScheme>,
    ) -> Self {
        let tickets = TicketBook::with_ttl(config.ticket_ttl);
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            sessions: Arc::new(SessionRegistry::new()),
            tickets,
            chat,
            board,
            hasher,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("sessions", &self.sessions)
            .field("tickets", &self.tickets)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes, the session gate and
/// request tracing.
pub fn create_router(state: AppState) -> Router {
    let assets = ServeDir::new(&state.config.assets_dir);

    Router::new()
        .route("/", get(get_login))
        .route("/login", get(get_login).post(post_login))
        .route("/register", get(get_register).post(post_register))
        .route("/logout", get(logout).post(logout))
        .route("/health", get(get_health))
        .route("/me", get(get_me))
        .route("/lobby", get(get_lobby))
        .route("/board", get(get_board_page))
        .route("/online", get(get_online))
        .route("/chat/history", get(get_chat_history))
        .route("/ws/chat", get(ws_chat))
        .route("/ws/board", get(ws_board))
        .route("/turn", get(get_turn))
        .route("/move", post(post_move))
        .nest_service("/assets", assets)
        .layer(middleware::from_fn_with_state(state.clone(), require_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Sessions
// ============================================================================

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(SESSION_MAX_AGE_DAYS))
        .build()
}

/// Mints a session for `username` and records it in both session stores.
async fn start_session(state: &AppState, username: &str) -> Result<String, AppError> {
    let token = session_token()?;
    state.credentials.set_session_token(username, &token).await?;
    state.sessions.store(&token, username);
    info!(username = %username, "Session started");
    Ok(token)
}

/// Runs a password scheme operation off the async executor.
async fn blocking_hash<T, F>(state: &AppState, op: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&dyn PasswordScheme) -> T + Send + 'static,
{
    let hasher = Arc::clone(&state.hasher);
    tokio::task::spawn_blocking(move || op(hasher.as_ref()))
        .await
        .map_err(|err| AppError::internal(format!("password task failed: {err}")))
}

// ============================================================================
// Login / logout
// ============================================================================

async fn get_login() -> Html<&'static str> {
    Html(pages::LOGIN_PAGE)
}

/// POST /login - Verifies the password and starts a session.
///
/// # Responses
///
/// - `303 See Other` to `/lobby` with the session cookie
/// - `400 Bad Request` - Missing fields
/// - `401 Unauthorized` - Unknown user or wrong password
async fn post_login(
    State(state): State<AppState>,
    jar: CookieJar,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<(CookieJar, Redirect), AppError> {
    let Form(form) = form.map_err(|err| AppError::validation(err.body_text()))?;
    if form.username.is_empty() || form.password.is_empty() {
        return Err(AppError::validation("username and password required"));
    }

    let Some(hash) = state.credentials.get_user(&form.username).await else {
        debug!(username = %form.username, "Login for unknown user");
        return Err(AuthError::BadCredentials.into());
    };

    let password = form.password;
    let verified = blocking_hash(&state, move |scheme| scheme.verify(&password, &hash)).await?;
    if !verified {
        debug!(username = %form.username, "Login with wrong password");
        return Err(AuthError::BadCredentials.into());
    }

    let token = start_session(&state, &form.username).await?;
    Ok((jar.add(session_cookie(token)), Redirect::to("/lobby")))
}

/// GET|POST /logout - Ends the session and expires the cookie.
///
/// Always succeeds. Both session copies are removed on a best-effort basis.
async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Json<serde_json::Value>) {
    let token = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty());

    if let Some(token) = token {
        state.sessions.remove(&token);
        // Only clear the durable token if this cookie is the one it holds.
        if let Some(username) = state.credentials.username_for_token(&token).await {
            if let Err(err) = state.credentials.clear_session_token(&username).await {
                warn!(username = %username, error = %err, "Failed to clear session token");
            }
            info!(username = %username, "Logged out");
        }
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, Json(json!({ "status": "logged out" })))
}

// ============================================================================
// Registration
// ============================================================================

/// GET /register - Issues a ticket bound to this client and embeds it in
/// the registration form.
async fn get_register(
    State(state): State<AppState>,
    client: ClientInfo,
) -> Result<Html<String>, AppError> {
    let token = state.tickets.issue(client)?;
    Ok(Html(pages::register_page(&token)))
}

/// POST /register - Redeems a ticket and creates the account.
///
/// # Responses
///
/// - `303 See Other` to `/lobby` with the session cookie
/// - `400 Bad Request` - Missing fields, bad ticket, or password policy
/// - `409 Conflict` - Username taken
/// - `500 Internal Server Error` - Durable store failure
async fn post_register(
    State(state): State<AppState>,
    client: ClientInfo,
    jar: CookieJar,
    form: Result<Form<RegistrationForm>, FormRejection>,
) -> Result<(CookieJar, Redirect), AppError> {
    let Form(form) = form.map_err(|err| AppError::validation(err.body_text()))?;
    if form.username.is_empty() || form.reg_token.is_empty() {
        return Err(AppError::validation("missing registration fields"));
    }

    // The ticket is taken before any account work and put back if that fails.
    let redeemed = state.tickets.redeem(&form.reg_token, &client)?;
    if let Err(err) = create_account(&state, &form.username, form.password).await {
        state.tickets.restore(redeemed);
        return Err(err);
    }
    info!(username = %form.username, "Account created");

    let token = start_session(&state, &form.username).await?;
    Ok((jar.add(session_cookie(token)), Redirect::to("/lobby")))
}

/// Applies the account policy, hashes the password and stores the account.
async fn create_account(state: &AppState, username: &str, password: String) -> Result<(), AppError> {
    validate_username(username)?;
    validate_password(&password)?;

    let hash = blocking_hash(state, move |scheme| scheme.hash(&password)).await??;
    state.credentials.create_user(username, &hash).await?;
    Ok(())
}

// ============================================================================
// Pages and session info
// ============================================================================

async fn get_lobby() -> Html<&'static str> {
    Html(pages::LOBBY_PAGE)
}

async fn get_board_page() -> Html<&'static str> {
    Html(pages::BOARD_PAGE)
}

/// Response body for `GET /me`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub username: String,
}

async fn get_me(user: CurrentUser) -> Json<MeResponse> {
    Json(MeResponse {
        username: user.username,
    })
}

/// Response body for `GET /online`.
#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineResponse {
    pub users: Vec<String>,
}

async fn get_online(State(state): State<AppState>) -> Json<OnlineResponse> {
    let users = state.credentials.online_usernames().await;
    Json(OnlineResponse {
        users: users.into_iter().collect(),
    })
}

/// Query parameters for `GET /chat/history`.
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// GET /chat/history - Recent messages, oldest first.
///
/// `limit` defaults to and is capped at the configured history limit.
async fn get_chat_history(
    State(state): State<AppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let Query(params) = params.map_err(|err| AppError::validation(err.body_text()))?;
    let limit = params
        .limit
        .unwrap_or(state.config.history_limit)
        .min(state.config.history_limit);
    let messages = state.chat.history(limit).await?;
    Ok(Json(messages))
}

// ============================================================================
// Board
// ============================================================================

async fn get_turn(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let snapshot = state.board.snapshot().await?;
    Ok(Json(json!({ "currentTurn": snapshot.turn.label() })))
}

/// POST /move - Applies a move through the board hub.
///
/// # Request Body
///
/// `{"row": 0-7, "col": 0-7, "player": "black" | "white"}`
///
/// # Responses
///
/// - `200 OK` - `{"status": "move accepted"}`, new board broadcast
/// - `400 Bad Request` - Malformed JSON or invalid move; the board is unchanged
async fn post_move(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let mv: MoveRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::validation(format!("invalid JSON: {err}")))?;
    trace!(username = %user.username, row = mv.row, col = mv.col, "Move submitted");

    state.board.apply_move(mv).await?;
    Ok(Json(json!({ "status": "move accepted" })))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live WebSocket connections across both hubs.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let chat = state.chat.connection_count().await.unwrap_or(0);
    let board = state.board.connection_count().await.unwrap_or(0);

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: chat + board,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// WebSockets
// ============================================================================

/// GET /ws/chat - Chat WebSocket.
///
/// On connect the client receives recent history, then every new message.
/// Text frames from the client are parsed as chat messages, attributed to the
/// session user, and published. Malformed frames are ignored.
async fn ws_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| chat_session(socket, state, user))
}

/// GET /ws/board - Board WebSocket (server to client only).
async fn ws_board(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| board_session(socket, state, user))
}

async fn chat_session(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (conn, outbox) = Connection::new(state.config.outbox_capacity);
    let _guard = ConnectionGuard::new(state.chat.clone(), conn.id());
    let connection_id = conn.id();
    let reply = conn.reply_handle();
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, outbox));

    if let Err(err) = state.chat.register(conn).await {
        warn!(error = %err, "Chat hub unavailable");
        writer.abort();
        return;
    }
    info!(username = %user.username, connection_id = %connection_id, "Chat client connected");

    tokio::select! {
        _ = &mut writer => {
            debug!(connection_id = %connection_id, "Chat writer finished");
        }
        _ = read_chat(&mut stream, &state.chat, &user, &reply) => {}
    }
    writer.abort();

    info!(username = %user.username, connection_id = %connection_id, "Chat client disconnected");
}

async fn read_chat(
    stream: &mut SplitStream<WebSocket>,
    chat: &ChatHub,
    user: &CurrentUser,
    reply: &Reply,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let message = match serde_json::from_str::<ChatMessage>(text.as_str()) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(username = %user.username, error = %err, "Rejected malformed chat frame");
                        if let Some(frame) = encode(&json!({"error": "malformed chat message"})) {
                            reply.send(frame);
                        }
                        continue;
                    }
                };
                if message.message.trim().is_empty() {
                    continue;
                }
                let message = message.attributed_to(&user.username, &user.token);
                if chat.publish(message).await.is_err() {
                    warn!("Chat hub stopped while publishing");
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("WebSocket client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        }
    }
}

async fn board_session(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (conn, outbox) = Connection::new(state.config.outbox_capacity);
    let _guard = ConnectionGuard::new(state.board.clone(), conn.id());
    let connection_id = conn.id();
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, outbox));

    if let Err(err) = state.board.register(conn).await {
        warn!(error = %err, "Board hub unavailable");
        writer.abort();
        return;
    }
    info!(username = %user.username, connection_id = %connection_id, "Board viewer connected");

    tokio::select! {
        _ = &mut writer => {}
        _ = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => trace!("Ignoring inbound board frame"),
                }
            }
        } => {}
    }
    writer.abort();

    info!(username = %user.username, connection_id = %connection_id, "Board viewer disconnected");
}

/// Drains a connection's outbox into the socket. Returns when the hub drops
/// the connection or the socket fails.
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outbox: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = sink.send(Message::Text(frame.to_string().into())).await {
            debug!(error = %err, "Failed to write to WebSocket client");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

// ============================================================================
// Tests
// ============================================================================
