//! Session gate and request-identity extractors.
//!
//! Every request passes through [`require_session`]. Paths on the public
//! allow-list go straight through. Everything else needs a `session` cookie
//! that resolves through the [`CredentialStore`] or the [`SessionRegistry`]:
//!
//! | Store | Registry | Outcome |
//! |-------|----------|---------|
//! | none | none | 401 `invalid or expired session` |
//! | `a` | none | accept as `a` |
//! | none | `a` | accept as `a` |
//! | `a` | `a` | accept as `a` |
//! | `a` | `b` | 401 `session mismatch` |
//!
//! An accepted request carries a [`CurrentUser`] extension.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use tracing::{debug, trace, warn};

use crate::credentials::CredentialStore;
use crate::error::{AppError, AuthError};
use crate::routes::AppState;
use crate::session::SessionRegistry;
use crate::tickets::ClientInfo;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session";

/// Exact paths reachable without a session.
pub const PUBLIC_PATHS: [&str; 5] = ["/", "/login", "/register", "/logout", "/health"];

/// Path prefix for static assets, reachable without a session.
pub const ASSETS_PREFIX: &str = "/assets/";

/// The authenticated user of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: String,
    pub token: String,
}

/// Returns true if `path` may be served without a session.
pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path) || path.starts_with(ASSETS_PREFIX)
}

/// Combines the two lookups of one token into a single decision.
pub fn reconcile(
    from_store: Option<String>,
    from_registry: Option<String>,
) -> Result<String, AuthError> {
    match (from_store, from_registry) {
        (None, None) => Err(AuthError::InvalidSession),
        (Some(username), None) | (None, Some(username)) => Ok(username),
        (Some(stored), Some(registered)) if stored == registered => Ok(stored),
        (Some(stored), Some(registered)) => {
            warn!(store = %stored, registry = %registered, "Session token resolves to different users");
            Err(AuthError::SessionMismatch)
        }
    }
}

/// Resolves a session token to its username through both sources.
pub async fn resolve_session(
    credentials: &CredentialStore,
    registry: &SessionRegistry,
    token: &str,
) -> Result<String, AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingSession);
    }
    let from_store = credentials.username_for_token(token).await;
    let from_registry = registry.lookup(token);
    reconcile(from_store, from_registry)
}

/// Session gate, installed with `axum::middleware::from_fn_with_state`.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_public_path(path) {
        trace!(path = %path, "Public path");
        return next.run(request).await;
    }

    let token = match jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) {
        Some(token) if !token.is_empty() => token,
        _ => {
            debug!(path = %path, "Request without session cookie");
            return AppError::from(AuthError::MissingSession).into_response();
        }
    };

    match resolve_session(&state.credentials, &state.sessions, &token).await {
        Ok(username) => {
            trace!(username = %username, "Session accepted");
            request.extensions_mut().insert(CurrentUser { username, token });
            next.run(request).await
        }
        Err(err) => {
            debug!(error = %err, "Session rejected");
            AppError::from(err).into_response()
        }
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AppError::Auth(AuthError::MissingSession))
    }
}

/// Client identity: first `X-Forwarded-For` hop, else the peer address, plus
/// the `User-Agent` header.
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);

        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(ClientInfo { ip, user_agent })
    }
}
