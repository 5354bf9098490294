//! Chat hub: live connections, ordered history, and fan-out.
//!
//! The hub task owns the live set and the in-memory history. Durable writes
//! are handed to a separate persistence worker that applies them one at a
//! time, in publish order, so the fan-out never waits on the store.
//!
//! A newly registered connection gets the recent history replayed before it
//! can see any later publish, because both happen on the hub task. The replay
//! reads the durable store first. Before that read the hub flushes the
//! persistence worker with a bounded wait; if the flush does not complete in
//! time, or any earlier write failed, the durable copy may lag what clients
//! already saw and the replay comes from memory instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{
    encode, send_detached, Connection, ConnectionId, Detach, HubError, LiveSet,
    DEFAULT_COMMAND_CAPACITY,
};
use crate::store::DurableStore;
use crate::types::ChatMessage;

/// Default number of messages replayed to a new connection.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Default wait for pending durable writes before a durable replay.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Tuning for a [`ChatHub`].
#[derive(Debug, Clone)]
pub struct ChatHubConfig {
    /// Messages replayed on register and retained in memory.
    pub history_limit: usize,
    /// Bounded wait on the persistence worker before a durable replay.
    pub flush_timeout: Duration,
    /// Capacity of the command channel.
    pub command_capacity: usize,
}

impl Default for ChatHubConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

enum Command {
    Register {
        conn: Connection,
        ack: oneshot::Sender<()>,
    },
    Unregister(ConnectionId),
    Publish(ChatMessage),
    History {
        limit: usize,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    ConnectionCount(oneshot::Sender<usize>),
}

/// Handle to a running chat hub.
#[derive(Debug, Clone)]
pub struct ChatHub {
    commands: mpsc::Sender<Command>,
}

impl ChatHub {
    /// Starts a hub. With a durable store, the in-memory history is seeded
    /// from its most recent messages first.
    pub async fn spawn(durable: Option<Arc<dyn DurableStore>>, config: ChatHubConfig) -> Self {
        let mut history = VecDeque::with_capacity(config.history_limit);
        if let Some(store) = &durable {
            match store.recent_messages(config.history_limit).await {
                Ok(recent) => history.extend(recent.into_iter().rev()),
                Err(err) => warn!(error = %err, "Could not seed chat history, starting empty"),
            }
        }

        let persistence = durable.map(|store| (Persistence::spawn(Arc::clone(&store)), store));
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));

        info!(
            history_len = history.len(),
            durable = persistence.is_some(),
            "Chat hub started"
        );

        let task = ChatTask {
            live: LiveSet::new(),
            history,
            persistence,
            config,
        };
        tokio::spawn(task.run(rx));

        Self { commands }
    }

    /// Adds `conn` to the live set and waits until the history replay has
    /// been queued on it.
    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Register { conn, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Removes a connection. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    /// Appends `message` to history, queues its durable write, and fans it out.
    pub async fn publish(&self, message: ChatMessage) -> Result<(), HubError> {
        self.send(Command::Publish(message)).await
    }

    /// Returns up to `limit` recent messages, oldest first, from the same
    /// source a newly registered connection would be replayed from.
    pub async fn history(&self, limit: usize) -> Result<Vec<ChatMessage>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History { limit, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectionCount(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

impl Detach for ChatHub {
    fn detach(&self, id: ConnectionId) {
        send_detached(&self.commands, Command::Unregister(id));
    }
}

struct ChatTask {
    live: LiveSet,
    history: VecDeque<ChatMessage>,
    persistence: Option<(Persistence, Arc<dyn DurableStore>)>,
    config: ChatHubConfig,
}

impl ChatTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Register { conn, ack } => {
                    self.register(conn).await;
                    let _ = ack.send(());
                }
                Command::Unregister(id) => {
                    if self.live.remove(id) {
                        debug!(connection_id = %id, live = self.live.len(), "Chat client left");
                    }
                }
                Command::Publish(message) => self.publish(message),
                Command::History { limit, reply } => {
                    let messages = self.replay_source(limit).await;
                    let _ = reply.send(messages);
                }
                Command::ConnectionCount(reply) => {
                    let _ = reply.send(self.live.len());
                }
            }
        }
        info!("Chat hub stopped");
    }

    async fn register(&mut self, conn: Connection) {
        let id = conn.id();
        self.live.insert(conn);
        debug!(connection_id = %id, live = self.live.len(), "Chat client joined");

        let replay = self.replay_source(self.config.history_limit).await;
        for message in &replay {
            let Some(frame) = encode(message) else { continue };
            if !self.live.send_to(id, &frame) {
                debug!(connection_id = %id, "Chat client dropped during replay");
                break;
            }
        }
        trace!(connection_id = %id, replayed = replay.len(), "History replayed");
    }

    fn publish(&mut self, message: ChatMessage) {
        if let Some((persistence, _)) = &self.persistence {
            persistence.insert(message.clone());
        }

        let Some(frame) = encode(&message) else { return };

        self.history.push_back(message);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        let evicted = self.live.broadcast(&frame);
        if evicted > 0 {
            debug!(evicted, live = self.live.len(), "Evicted chat clients during broadcast");
        }
    }

    /// Recent messages, oldest first: durable when it is known to be in sync,
    /// otherwise the in-memory history.
    async fn replay_source(&self, limit: usize) -> Vec<ChatMessage> {
        if let Some((persistence, store)) = &self.persistence {
            if persistence.flush(self.config.flush_timeout).await {
                match store.recent_messages(limit).await {
                    Ok(mut recent) => {
                        recent.reverse();
                        return recent;
                    }
                    Err(err) => warn!(error = %err, "Durable history read failed, using memory"),
                }
            } else {
                debug!("Durable history not in sync, replaying from memory");
            }
        }

        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }
}

enum PersistOp {
    Insert(ChatMessage),
    Flush(oneshot::Sender<bool>),
}

/// Ordered, fire-and-forget durable writer.
struct Persistence {
    ops: mpsc::UnboundedSender<PersistOp>,
}

impl Persistence {
    fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (ops, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Once a write is lost the durable history is permanently behind.
            let mut in_sync = true;
            while let Some(op) = rx.recv().await {
                match op {
                    PersistOp::Insert(message) => {
                        if let Err(err) = store.insert_message(&message).await {
                            warn!(error = %err, "Failed to persist chat message");
                            in_sync = false;
                        }
                    }
                    PersistOp::Flush(reply) => {
                        let _ = reply.send(in_sync);
                    }
                }
            }
        });
        Self { ops }
    }

    fn insert(&self, message: ChatMessage) {
        if self.ops.send(PersistOp::Insert(message)).is_err() {
            warn!("Persistence worker stopped, chat message not stored");
        }
    }

    /// Waits for every queued write. Returns true only if all writes so far
    /// landed and the wait finished within `timeout`.
    async fn flush(&self, timeout: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.ops.send(PersistOp::Flush(reply)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(true)))
    }
}
