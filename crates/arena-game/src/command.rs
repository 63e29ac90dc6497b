//! Commands and status types for driving the game engine.
//!
//! [`EngineCommand`] is the bounded-channel message type the controller,
//! the daemon and tests use to drive the engine. Each command carries a
//! `tokio::sync::oneshot::Sender` for the reply.
//!
//! All commands are processed sequentially inside the engine loop, so
//! the engine's game and ledger have exactly one owner.

use arena_types::{ArenaError, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::engine::EngineStage;
use crate::state::GameSnapshot;

// ---------------------------------------------------------------------------
// EngineCommand
// ---------------------------------------------------------------------------

/// Commands accepted by the engine loop.
pub enum EngineCommand {
    /// Mount a new game of the given mode.
    NewGame {
        mode: String,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Start the mounted game. Blocks the engine loop until the nodes
    /// are ready and agree on the mode, or shutdown fires.
    StartGame { reply: oneshot::Sender<Result<()>> },

    /// End the running game now.
    EndGame { reply: oneshot::Sender<Result<()>> },

    /// Report the current stage and ledger.
    Status { reply: oneshot::Sender<EngineStatus> },
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewGame { mode, .. } => f
                .debug_struct("NewGame")
                .field("mode", mode)
                .finish_non_exhaustive(),
            Self::StartGame { .. } => f.write_str("StartGame"),
            Self::EndGame { .. } => f.write_str("EndGame"),
            Self::Status { .. } => f.write_str("Status"),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineStatus
// ---------------------------------------------------------------------------

/// Snapshot of the engine. All fields are cloned, so the reply is
/// self-contained.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub stage: EngineStage,
    /// Mode of the mounted game, if any.
    pub mode: Option<String>,
    /// Id of the mounted game, if any.
    pub game_id: Option<String>,
    /// The current ledger.
    pub game: GameSnapshot,
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Cloneable client for the engine loop.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    /// Mounts a new game. Fails with `GameRunning` while a game runs.
    pub async fn new_game(&self, mode: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::NewGame {
            mode: mode.to_string(),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    /// Starts the mounted game; resolves once it runs (or was failed on
    /// a rule violation).
    pub async fn start_game(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::StartGame { reply }).await?;
        recv(rx).await?
    }

    /// Ends the running game.
    pub async fn end_game(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::EndGame { reply }).await?;
        recv(rx).await?
    }

    /// Current stage and ledger.
    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Status { reply }).await?;
        recv(rx).await
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ArenaError::ChannelClosed {
                reason: "engine command queue closed".into(),
            })
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await.map_err(|_| ArenaError::ChannelClosed {
        reason: "engine dropped the reply".into(),
    })
}
