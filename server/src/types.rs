//! Wire types shared between the HTTP handlers, the hubs, and the store.
//!
//! Inbound payloads reject unknown fields so that malformed client frames are
//! refused instead of being partially applied.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Number of rows and columns on the game board.
pub const BOARD_SIZE: usize = 8;

/// A chat message as exchanged over the chat WebSocket.
///
/// `account_token` identifies the author's session for storage only and is
/// never serialized back to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    #[serde(default, skip_serializing)]
    pub account_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl ChatMessage {
    /// Creates a message with only its text set.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            account_token: None,
            username: None,
            message: message.into(),
            time: None,
        }
    }

    /// Overwrites the author fields with the server-side session and stamps
    /// the current UTC time when the client did not provide one.
    pub fn attributed_to(mut self, username: &str, token: &str) -> Self {
        self.username = Some(username.to_string());
        self.account_token = Some(token.to_string());
        if self.time.as_deref().map_or(true, str::is_empty) {
            self.time = Some(utc_timestamp());
        }
        self
    }
}

/// Returns the current time as an ISO-8601 / RFC 3339 UTC string.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A participant in the board game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Player {
    Black,
    White,
}

impl Player {
    /// Every player, in turn order.
    pub const ALL: [Player; 2] = [Player::Black, Player::White];

    /// The label used on the wire.
    pub fn label(self) -> &'static str {
        match self {
            Self::Black => "black",
            Self::White => "white",
        }
    }

    /// Parses a wire label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.label() == label)
    }

    /// The player whose turn follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::Black => Self::White,
            Self::White => Self::Black,
        }
    }
}

/// A single board cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cell {
    #[default]
    #[serde(rename = "")]
    Empty,
    Black,
    White,
}

impl From<Player> for Cell {
    fn from(player: Player) -> Self {
        match player {
            Player::Black => Self::Black,
            Player::White => Self::White,
        }
    }
}

/// Full board snapshot broadcast to board viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardUpdate {
    pub board: [[Cell; BOARD_SIZE]; BOARD_SIZE],
    pub turn: Player,
}

/// Move submitted over HTTP.
///
/// Coordinates are signed so that negative values reach validation instead
/// of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveRequest {
    pub row: i64,
    pub col: i64,
    pub player: String,
}

/// Form body for `POST /register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub reg_token: String,
}

/// Form body for `POST /login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}
