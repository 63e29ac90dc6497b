//! Core shared types for the arena game cluster.
//!
//! Every crate in the workspace speaks in terms of the types defined
//! here: [`GameEvent`] for anything that travels between components,
//! [`GameStatus`] for the lifecycle of a game (and of a node's view of
//! it), and [`ArenaError`] as the single error surface.

pub mod config;
pub mod protocol;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// GameEvent
// ---------------------------------------------------------------------------

/// A named event with an opaque payload.
///
/// Events are immutable once built and are delivered at most once to a
/// single consumer. The payload is usually short colon-delimited text
/// (see [`protocol`]) but is carried as raw bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Event name, e.g. `game:mode` or `alpha:team:hit`.
    pub name: String,
    /// Raw payload bytes.
    #[serde(with = "payload_text")]
    pub payload: Vec<u8>,
}

impl GameEvent {
    /// Creates a new event.
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Creates an event with an empty payload.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Returns the payload as UTF-8 text, replacing invalid sequences.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for GameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.payload_str())
    }
}

/// Payloads are text in practice; persist them as strings so game logs
/// stay readable.
mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        Ok(text.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// GameStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a game.
///
/// Transitions are monotonic: `Init → Running → {Ended | Failed}`
/// (a game may also fail straight from `Init`). See
/// [`GameStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum GameStatus {
    /// Created, not yet started.
    #[default]
    #[serde(rename = "game:init")]
    Init,
    /// Started and accepting hits.
    #[serde(rename = "game:running")]
    Running,
    /// Finished normally.
    #[serde(rename = "game:over")]
    Ended,
    /// Aborted because a game rule was violated.
    #[serde(rename = "game:failed")]
    Failed,
}

impl GameStatus {
    /// Returns `true` if moving from `self` to `next` keeps the
    /// lifecycle monotonic. Re-entering the current status is allowed.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        use GameStatus::*;
        matches!(
            (self, next),
            (Init, Init)
                | (Init, Running)
                | (Init, Failed)
                | (Running, Running)
                | (Running, Ended)
                | (Running, Failed)
                | (Ended, Ended)
                | (Failed, Failed)
        )
    }

    /// Returns `true` for `Ended` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "game:init"),
            Self::Running => write!(f, "game:running"),
            Self::Ended => write!(f, "game:over"),
            Self::Failed => write!(f, "game:failed"),
        }
    }
}

impl FromStr for GameStatus {
    type Err = ArenaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "game:init" => Ok(Self::Init),
            "game:running" => Ok(Self::Running),
            "game:over" => Ok(Self::Ended),
            "game:failed" => Ok(Self::Failed),
            other => Err(ArenaError::InvalidPayload {
                reason: format!("unknown game status '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ArenaError
// ---------------------------------------------------------------------------

/// Central error type for the arena workspace.
///
/// Game-rule violations (`MinNodeCount` through `RequiredTeam`) are not
/// fatal to the process: the engine fails the current game and keeps
/// serving. Everything else is surfaced to the caller.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// A game is running; it must end before another can be mounted or started.
    #[error("current game is still running")]
    GameRunning,

    /// No game has been mounted yet.
    #[error("no game mounted")]
    NoGameMounted,

    /// The cluster did not report enough ready nodes.
    #[error("game nodes are not ready: {reason}")]
    NodesNotReady {
        /// What went wrong while polling readiness.
        reason: String,
    },

    /// Fewer nodes than the ruleset's minimum.
    #[error("not enough nodes: {count} < {min}")]
    MinNodeCount { count: usize, min: usize },

    /// More nodes than the ruleset's maximum.
    #[error("too many nodes: {count} > {max}")]
    MaxNodeCount { count: usize, max: usize },

    /// Fewer teams than the ruleset's minimum.
    #[error("not enough teams: {count} < {min}")]
    MinTeamCount { count: usize, min: usize },

    /// More teams than the ruleset's maximum.
    #[error("too many teams: {count} > {max}")]
    MaxTeamCount { count: usize, max: usize },

    /// A node the ruleset requires did not take part.
    #[error("missing required node '{name}'")]
    RequiredNode { name: String },

    /// A team the ruleset requires is not configured.
    #[error("missing required team '{name}'")]
    RequiredTeam { name: String },

    /// A status change would move the lifecycle backwards.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: GameStatus, to: GameStatus },

    /// The operation needs a running game.
    #[error("game is not running (status {status})")]
    GameNotRunning { status: GameStatus },

    /// The requested game mode has no registered constructor.
    #[error("unsupported game mode '{mode}'")]
    UnsupportedMode { mode: String },

    /// A UI/API action name outside the allowed set.
    #[error("action '{action}' is not allowed")]
    ActionNotAllowed { action: String },

    /// A sensor request named a sensor this node does not own, or the
    /// node has no sensor to pick at random.
    #[error("no sensor '{id}' on this node")]
    UnknownSensor { id: String },

    /// A color request could not be resolved (no colors configured).
    #[error("cannot pick a color: {reason}")]
    NoColor { reason: String },

    /// A payload could not be decoded.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Human-readable description of the decoding failure.
        reason: String,
    },

    /// Join, broadcast or query against the cluster failed.
    #[error("cluster error: {reason}")]
    ClusterError {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// An in-process queue or reply slot was closed.
    #[error("channel closed: {reason}")]
    ChannelClosed {
        /// Which channel closed.
        reason: String,
    },

    /// Reading or writing the game log failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the I/O failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// The owning task group was asked to stop.
    #[error("operation cancelled")]
    Cancelled,
}

impl ArenaError {
    /// Returns `true` for the structural game-rule violations that
    /// fail a game without stopping the process.
    pub fn is_rule_violation(&self) -> bool {
        matches!(
            self,
            Self::MinNodeCount { .. }
                | Self::MaxNodeCount { .. }
                | Self::MinTeamCount { .. }
                | Self::MaxTeamCount { .. }
                | Self::RequiredNode { .. }
                | Self::RequiredTeam { .. }
        )
    }

    /// Returns `true` if this error only reports a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`ArenaError`].
pub type Result<T> = std::result::Result<T, ArenaError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use GameStatus::*;
        assert!(Init.can_transition_to(Running));
        assert!(Running.can_transition_to(Ended));
        assert!(Running.can_transition_to(Failed));
        assert!(Init.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Init));
        assert!(!Ended.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Ended.can_transition_to(Failed));
        assert!(!Init.can_transition_to(Ended));
    }

    #[test]
    fn status_display_matches_wire_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        for status in [
            GameStatus::Init,
            GameStatus::Running,
            GameStatus::Ended,
            GameStatus::Failed,
        ] {
            let parsed: GameStatus = status.to_string().parse()?;
            assert_eq!(parsed, status);
        }
        assert_eq!(GameStatus::Ended.to_string(), "game:over");
        Ok(())
    }

    #[test]
    fn event_payload_serializes_as_text() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let evt = GameEvent::new("game:error", "not enough nodes");
        let json = serde_json::to_string(&evt)?;
        assert!(json.contains("\"not enough nodes\""));
        let back: GameEvent = serde_json::from_str(&json)?;
        assert_eq!(back, evt);
        Ok(())
    }

    #[test]
    fn rule_violations_are_classified() {
        assert!(ArenaError::MinNodeCount { count: 2, min: 3 }.is_rule_violation());
        assert!(ArenaError::RequiredTeam { name: "red".into() }.is_rule_violation());
        assert!(!ArenaError::GameRunning.is_rule_violation());
        assert!(ArenaError::Cancelled.is_cancelled());
    }

    #[test]
    fn error_display() {
        let err = ArenaError::MinNodeCount { count: 2, min: 3 };
        assert_eq!(err.to_string(), "not enough nodes: 2 < 3");
    }
}
