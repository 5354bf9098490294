//! Board hub: the single shared game board and its viewers.
//!
//! Moves are applied inside the hub task, so validation, the grid update, the
//! turn change and the broadcast form one step that no other move can
//! interleave with. Viewers only receive; moves arrive over HTTP.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{
    encode, send_detached, Connection, ConnectionId, Detach, HubError, LiveSet,
    DEFAULT_COMMAND_CAPACITY,
};
use crate::types::{BoardUpdate, Cell, MoveRequest, Player, BOARD_SIZE};

/// The board grid plus whose turn it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardState {
    board: [[Cell; BOARD_SIZE]; BOARD_SIZE],
    turn: Player,
}

impl BoardState {
    /// The opening position: four discs in the centre, black to move.
    pub fn new() -> Self {
        let mut board = [[Cell::Empty; BOARD_SIZE]; BOARD_SIZE];
        board[3][3] = Cell::White;
        board[3][4] = Cell::Black;
        board[4][3] = Cell::Black;
        board[4][4] = Cell::White;
        Self {
            board,
            turn: Player::Black,
        }
    }

    /// Whose turn it is.
    pub fn turn(&self) -> Player {
        self.turn
    }

    /// The current board as a wire snapshot.
    pub fn snapshot(&self) -> BoardUpdate {
        BoardUpdate {
            board: self.board,
            turn: self.turn,
        }
    }

    /// Places a disc and passes the turn.
    ///
    /// Any cell may be overwritten and the mover is not required to hold the
    /// turn. Out-of-range coordinates and unknown players are rejected and
    /// leave the state untouched.
    pub fn apply(&mut self, mv: &MoveRequest) -> Result<BoardUpdate, HubError> {
        let row = board_index(mv.row)
            .ok_or_else(|| HubError::InvalidMove(format!("row {} out of range", mv.row)))?;
        let col = board_index(mv.col)
            .ok_or_else(|| HubError::InvalidMove(format!("col {} out of range", mv.col)))?;
        let player = Player::from_label(&mv.player)
            .ok_or_else(|| HubError::InvalidMove(format!("unknown player {:?}", mv.player)))?;

        self.board[row][col] = Cell::from(player);
        self.turn = self.turn.next();
        Ok(self.snapshot())
    }
}

impl Default for BoardState {
    fn default() -> Self {
        Self::new()
    }
}

fn board_index(value: i64) -> Option<usize> {
    usize::try_from(value).ok().filter(|v| *v < BOARD_SIZE)
}

enum Command {
    Register {
        conn: Connection,
        ack: oneshot::Sender<()>,
    },
    Unregister(ConnectionId),
    Move {
        mv: MoveRequest,
        reply: oneshot::Sender<Result<BoardUpdate, HubError>>,
    },
    Snapshot(oneshot::Sender<BoardUpdate>),
    ConnectionCount(oneshot::Sender<usize>),
}

/// Handle to a running board hub.
#[derive(Debug, Clone)]
pub struct BoardHub {
    commands: mpsc::Sender<Command>,
}

impl BoardHub {
    /// Starts a hub with the opening position.
    pub fn spawn() -> Self {
        Self::spawn_with(BoardState::new(), DEFAULT_COMMAND_CAPACITY)
    }

    /// Starts a hub from an explicit state.
    pub fn spawn_with(state: BoardState, command_capacity: usize) -> Self {
        let (commands, rx) = mpsc::channel(command_capacity.max(1));
        tokio::spawn(run(state, rx));
        info!("Board hub started");
        Self { commands }
    }

    /// Adds a viewer and waits until the current board has been queued on it.
    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Register { conn, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Removes a viewer. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    /// Validates and applies a move, broadcasts the new board, and returns it.
    pub async fn apply_move(&self, mv: MoveRequest) -> Result<BoardUpdate, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Move { mv, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// The current board and turn.
    pub async fn snapshot(&self) -> Result<BoardUpdate, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of live viewers.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectionCount(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

impl Detach for BoardHub {
    fn detach(&self, id: ConnectionId) {
        send_detached(&self.commands, Command::Unregister(id));
    }
}

async fn run(mut state: BoardState, mut commands: mpsc::Receiver<Command>) {
    let mut live = LiveSet::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { conn, ack } => {
                let id = conn.id();
                live.insert(conn);
                if let Some(frame) = encode(&state.snapshot()) {
                    live.send_to(id, &frame);
                }
                debug!(connection_id = %id, live = live.len(), "Board viewer joined");
                let _ = ack.send(());
            }
            Command::Unregister(id) => {
                if live.remove(id) {
                    debug!(connection_id = %id, live = live.len(), "Board viewer left");
                }
            }
            Command::Move { mv, reply } => {
                let result = state.apply(&mv);
                match &result {
                    Ok(update) => {
                        debug!(row = mv.row, col = mv.col, player = %mv.player, "Move applied");
                        if let Some(frame) = encode(update) {
                            let evicted = live.broadcast(&frame);
                            if evicted > 0 {
                                debug!(evicted, "Evicted board viewers during broadcast");
                            }
                        }
                    }
                    Err(err) => debug!(error = %err, "Move rejected"),
                }
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
            Command::ConnectionCount(reply) => {
                let _ = reply.send(live.len());
            }
        }
    }
    info!("Board hub stopped");
}
