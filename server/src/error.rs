//! HTTP-facing error type for the lobby server.
//!
//! Each component has its own error enum next to its code. Handlers convert
//! them into [`AppError`], which picks the status code and renders the body
//! as `{"error": "<message>"}`.
//!
//! | Variant | Status |
//! |---------|--------|
//! | [`AppError::Auth`] | 401 |
//! | [`AppError::Ticket`], [`AppError::Validation`] | 400 |
//! | [`AppError::Conflict`] | 409 |
//! | [`AppError::Unavailable`] | 503 |
//! | [`AppError::Internal`] | 500 |
//!
//! Internal failures are logged with their detail and reported to the client
//! with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::credentials::CredentialError;
use crate::hub::HubError;
use crate::password::PasswordError;
use crate::tickets::TicketError;
use crate::token::TokenError;

/// Authentication failures raised by the session gate and the login flow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No session cookie, or an empty one.
    #[error("missing or invalid session")]
    MissingSession,

    /// Neither the registry nor the credential store knows the token.
    #[error("invalid or expired session")]
    InvalidSession,

    /// The registry and the credential store map the token to different users.
    #[error("session mismatch")]
    SessionMismatch,

    /// Unknown username or wrong password.
    #[error("invalid username or password")]
    BadCredentials,
}

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    /// Malformed or unacceptable request data.
    #[error("{0}")]
    Validation(String),

    /// The resource already exists.
    #[error("{0}")]
    Conflict(String),

    /// A hub is not running.
    #[error("service unavailable")]
    Unavailable,

    /// Anything else. The detail is logged, never sent.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Ticket(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the client.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!(detail = %detail, "Request failed");
        }
        let body = Json(json!({ "error": self.public_message() }));
        (self.status(), body).into_response()
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::AlreadyExists => Self::Conflict(err.to_string()),
            CredentialError::Store(detail) => Self::Internal(detail),
        }
    }
}

impl From<PasswordError> for AppError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::EmptyUsername | PasswordError::TooShort => {
                Self::Validation(err.to_string())
            }
            PasswordError::Entropy(_) | PasswordError::Hashing(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Closed => Self::Unavailable,
            HubError::InvalidMove(reason) => Self::Validation(format!("invalid move: {reason}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn missing_session_body() {
        let (status, body) = body_of(AuthError::MissingSession.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "missing or invalid session"}));
    }

    #[tokio::test]
    async fn ticket_errors_are_bad_requests() {
        for err in [
            TicketError::InvalidToken,
            TicketError::TokenExpired,
            TicketError::ClientMismatch,
        ] {
            let message = err.to_string();
            let (status, body) = body_of(err.into()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], message);
        }
    }

    #[tokio::test]
    async fn duplicate_user_is_conflict() {
        let (status, body) = body_of(CredentialError::AlreadyExists.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "user already exists");
    }

    #[tokio::test]
    async fn store_failure_does_not_leak_detail() {
        let err: AppError = CredentialError::Store("disk I/O error at /var/db".to_string()).into();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "internal server error"}));
    }

    #[tokio::test]
    async fn hub_errors() {
        let (status, _) = body_of(HubError::Closed.into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = body_of(HubError::InvalidMove("col 9 out of range".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid move: col 9 out of range");
    }

    #[test]
    fn password_policy_is_validation() {
        let err: AppError = PasswordError::TooShort.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "password must be at least 6 characters");
    }

    #[test]
    fn auth_messages() {
        assert_eq!(AuthError::InvalidSession.to_string(), "invalid or expired session");
        assert_eq!(AuthError::SessionMismatch.to_string(), "session mismatch");
    }
}
