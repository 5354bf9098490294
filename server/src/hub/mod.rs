//! Real-time broadcast hubs.
//!
//! Each hub is an actor: one spawned task owns the live connection set and the
//! shared state (chat history or the board), and every mutation arrives as a
//! command on a bounded channel. Handles are cheap to clone and only ever talk
//! to the task, so Register, Unregister and Publish are linearized by
//! construction.
//!
//! # Connections
//!
//! A [`Connection`] is the hub's view of one client: an id plus the sending
//! half of a bounded outbox. The socket task drains the receiving half into
//! the WebSocket. The hub never awaits a client. It uses `try_send`, and a
//! full or closed outbox counts as a failed write: the connection is evicted
//! in the same pass and its sender dropped, which ends the socket writer.
//!
//! # Example
//!
//! ```rust
//! use lobby_server::hub::{Connection, LiveSet};
//!
//! let mut live = LiveSet::new();
//! let (conn, mut outbox) = Connection::new(8);
//! let id = conn.id();
//! live.insert(conn);
//!
//! assert_eq!(live.broadcast(&"hello".into()), 0);
//! assert_eq!(&*outbox.try_recv().unwrap(), "hello");
//! assert!(live.remove(id));
//! assert!(!live.remove(id));
//! ```

pub mod board;
pub mod chat;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};
use uuid::Uuid;

pub use board::BoardHub;
pub use chat::ChatHub;

/// Default per-connection outbox size. Must exceed the chat replay length so a
/// full history replay never overflows a fresh connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 512;

/// Default size of a hub's command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

/// Identifier of a live connection.
pub type ConnectionId = Uuid;

/// A serialized outbound frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Errors returned by hub handles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub task has stopped and no longer accepts commands.
    #[error("hub is not running")]
    Closed,

    /// A board move failed validation. The board was not changed.
    #[error("invalid move: {0}")]
    InvalidMove(String),
}

/// The hub's handle to one live client.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    outbox: mpsc::Sender<Frame>,
}

impl Connection {
    /// Creates a connection with a fresh id and an outbox of `capacity` frames.
    ///
    /// The returned receiver must be drained by the socket writer.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                outbox,
            },
            rx,
        )
    }

    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// A handle for replying to this client alone.
    ///
    /// The handle does not keep the outbox open, so an evicted connection
    /// still sees its writer finish.
    pub fn reply_handle(&self) -> Reply {
        Reply(self.outbox.downgrade())
    }

    fn deliver(&self, frame: &Frame) -> bool {
        match self.outbox.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %self.id, "Outbox full, dropping slow connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "Outbox closed, dropping dead connection");
                false
            }
        }
    }
}

/// The set of live connections owned by a hub task.
#[derive(Debug, Default)]
pub struct LiveSet {
    connections: HashMap<ConnectionId, Connection>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. A connection with the same id is replaced.
    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.id, conn);
    }

    /// Removes a connection, dropping its outbox sender. Removing an absent
    /// id is a no-op that returns false.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    /// Returns true if `id` is live.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Writes `frame` to a single connection, evicting it on failure.
    ///
    /// Returns false if the connection is absent or was evicted.
    pub fn send_to(&mut self, id: ConnectionId, frame: &Frame) -> bool {
        let delivered = match self.connections.get(&id) {
            Some(conn) => conn.deliver(frame),
            None => return false,
        };
        if !delivered {
            self.connections.remove(&id);
        }
        delivered
    }

    /// Writes `frame` to every connection and evicts each one whose write
    /// failed. Returns the number of evicted connections.
    pub fn broadcast(&mut self, frame: &Frame) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, conn| conn.deliver(frame));
        before - self.connections.len()
    }
}

/// Sends frames to one connection outside the hub's broadcast order.
#[derive(Debug, Clone)]
pub struct Reply(mpsc::WeakSender<Frame>);

impl Reply {
    /// Queues `frame` without waiting. Returns false once the connection is
    /// gone or its outbox is full.
    pub fn send(&self, frame: Frame) -> bool {
        match self.0.upgrade() {
            Some(outbox) => outbox.try_send(frame).is_ok(),
            None => false,
        }
    }
}

/// Serializes a value into a shareable frame.
pub fn encode<T: Serialize>(value: &T) -> Option<Frame> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            error!(error = %err, "Failed to serialize outbound frame");
            None
        }
    }
}

/// A hub that can be told, without awaiting, that a connection is gone.
pub trait Detach: Clone + Send + Sync + 'static {
    /// Queues an Unregister for `id`. Must not block and must not panic.
    fn detach(&self, id: ConnectionId);
}

/// Unregisters a connection from its hub when dropped.
///
/// The socket task holds the guard for its whole lifetime, so the connection
/// leaves the live set on a normal close, a transport error, or a panic.
#[derive(Debug)]
pub struct ConnectionGuard<H: Detach> {
    hub: H,
    id: ConnectionId,
}

impl<H: Detach> ConnectionGuard<H> {
    pub fn new(hub: H, id: ConnectionId) -> Self {
        Self { hub, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<H: Detach> Drop for ConnectionGuard<H> {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

/// Sends `command` on `commands` without awaiting.
///
/// If the channel is momentarily full the send is finished on a spawned task.
/// Outside a runtime, or once the hub has stopped, the command is dropped.
pub(crate) fn send_detached<C: Send + 'static>(commands: &mpsc::Sender<C>, command: C) {
    match commands.try_send(command) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(command)) => {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let commands = commands.clone();
                runtime.spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
        }
    }
}
