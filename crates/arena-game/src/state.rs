//! Score ledger of the current game.
//!
//! [`GameState`] is shared between the engine loop and its background
//! scoreboard refresh, so every field sits behind one `std::sync::Mutex`
//! that is only held for O(1) updates and never across an `.await`.
//!
//! # Invariants
//!
//! - Status only moves forward: `Init → Running → {Ended | Failed}`.
//! - Scoreboard and nodeboard are replaced together, never one alone.
//! - At most one scoreboard refresh is in flight (`checking`).
//!
//! Expiry and refresh cadence use the monotonic tokio clock; the
//! recorded timestamps use wall-clock UTC.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arena_types::config::{parse_game_length, GameConfig};
use arena_types::protocol::{join_team_list, GAME_ERROR};
use arena_types::{ArenaError, GameEvent, GameStatus, Result};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One timeline entry: an event and when it was recorded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GameEvent,
}

/// Serializable copy of a [`GameState`]; the end-of-game log format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub status: GameStatus,
    pub teams: Vec<String>,
    pub nodes: Vec<String>,
    pub colors: Vec<String>,
    pub scoreboard: BTreeMap<String, u64>,
    pub nodeboard: BTreeMap<String, u64>,
    pub winner: Option<String>,
    pub highscore: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub game_duration_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub timeline: Vec<TimelineEntry>,
    pub config: GameConfig,
}

// ---------------------------------------------------------------------------
// GameState
// ---------------------------------------------------------------------------

struct Inner {
    status: GameStatus,
    teams: Vec<String>,
    nodes: Vec<String>,
    colors: Vec<String>,
    scoreboard: BTreeMap<String, u64>,
    nodeboard: BTreeMap<String, u64>,
    winner: Option<String>,
    highscore: u64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    game_duration: Duration,
    last_check: Option<Instant>,
    last_check_at: Option<DateTime<Utc>>,
    checking: bool,
    timeline: Vec<TimelineEntry>,
}

/// Mutable ledger for one game, created fresh for every mounted game.
pub struct GameState {
    config: GameConfig,
    inner: Mutex<Inner>,
}

impl GameState {
    /// Creates an `Init` ledger seeded with the ruleset's teams, nodes
    /// and colors.
    pub fn new(config: GameConfig) -> Self {
        let inner = Inner {
            status: GameStatus::Init,
            teams: config.teams.clone(),
            nodes: config.nodes.clone(),
            colors: config.colors.clone(),
            scoreboard: BTreeMap::new(),
            nodeboard: BTreeMap::new(),
            winner: None,
            highscore: 0,
            started_at: None,
            ended_at: None,
            started: None,
            game_duration: Duration::ZERO,
            last_check: None,
            last_check_at: None,
            checking: false,
            timeline: Vec::new(),
        };
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    // The ledger stays consistent under panic since every update is a
    // plain field store, so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The immutable ruleset.
    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn status(&self) -> GameStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == GameStatus::Running
    }

    /// Moves to `next`, rejecting backward transitions.
    pub fn set_status(&self, next: GameStatus) -> Result<()> {
        let mut inner = self.lock();
        transition(&mut inner, next)
    }

    /// Parses the game length, then flips to `Running` and records the
    /// start. A bad length leaves the status untouched.
    pub fn setup(&self) -> Result<()> {
        let duration = parse_game_length(&self.config.game_length)?;
        let mut inner = self.lock();
        transition(&mut inner, GameStatus::Running)?;
        inner.game_duration = duration;
        inner.started = Some(Instant::now());
        inner.started_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the game `Ended` and records the end time.
    pub fn end(&self) -> Result<()> {
        let mut inner = self.lock();
        transition(&mut inner, GameStatus::Ended)?;
        inner.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the game `Failed` and records why on the timeline.
    pub fn fail(&self, err: &ArenaError) -> Result<()> {
        let mut inner = self.lock();
        transition(&mut inner, GameStatus::Failed)?;
        inner.ended_at = Some(Utc::now());
        inner.timeline.push(TimelineEntry {
            at: Utc::now(),
            event: GameEvent::new(GAME_ERROR, err.to_string()),
        });
        Ok(())
    }

    /// `true` once the game has ended or its duration has elapsed.
    pub fn time_expired(&self) -> bool {
        self.time_expired_at(Instant::now())
    }

    /// [`time_expired`](Self::time_expired) against an explicit clock.
    pub fn time_expired_at(&self, now: Instant) -> bool {
        let inner = self.lock();
        if inner.status == GameStatus::Ended {
            return true;
        }
        match inner.started {
            Some(started) => now >= started + inner.game_duration,
            None => false,
        }
    }

    /// Time left before expiry, zero once expired or before start.
    pub fn time_remaining(&self) -> Duration {
        let inner = self.lock();
        match inner.started {
            Some(started) => inner.game_duration.saturating_sub(started.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn game_duration(&self) -> Duration {
        self.lock().game_duration
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    /// Adds a node if not already present.
    pub fn add_node(&self, node: &str) {
        let mut inner = self.lock();
        if !inner.nodes.iter().any(|n| n == node) {
            inner.nodes.push(node.to_string());
        }
    }

    /// Adds a team if not already present.
    pub fn add_team(&self, team: &str) {
        let mut inner = self.lock();
        if !inner.teams.iter().any(|t| t == team) {
            inner.teams.push(team.to_string());
        }
    }

    pub fn teams(&self) -> Vec<String> {
        self.lock().teams.clone()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.lock().nodes.clone()
    }

    pub fn colors(&self) -> Vec<String> {
        self.lock().colors.clone()
    }

    /// Comma-delimited team roster, as broadcast to nodes.
    pub fn team_list(&self) -> String {
        join_team_list(&self.lock().teams)
    }

    pub fn random_team(&self) -> Option<String> {
        self.lock().teams.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn random_node(&self) -> Option<String> {
        self.lock().nodes.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn random_color(&self) -> Option<String> {
        self.lock().colors.choose(&mut rand::thread_rng()).cloned()
    }

    // -----------------------------------------------------------------------
    // Scores
    // -----------------------------------------------------------------------

    /// Replaces both boards and closes the in-flight refresh.
    pub fn set_boards(&self, scoreboard: BTreeMap<String, u64>, nodeboard: BTreeMap<String, u64>) {
        let mut inner = self.lock();
        inner.scoreboard = scoreboard;
        inner.nodeboard = nodeboard;
        inner.last_check = Some(Instant::now());
        inner.last_check_at = Some(Utc::now());
        inner.checking = false;
    }

    /// Applies a background refresh. The boards are only taken while the
    /// game is still running so a late refresh cannot overwrite the
    /// final score; `checking` is cleared either way.
    pub fn refresh_boards(
        &self,
        scoreboard: BTreeMap<String, u64>,
        nodeboard: BTreeMap<String, u64>,
    ) -> bool {
        if self.is_running() {
            self.set_boards(scoreboard, nodeboard);
            return true;
        }
        self.clear_checking();
        false
    }

    /// Claims the refresh slot if no refresh is in flight and at least
    /// `interval` passed since the last one. A never-checked game is due.
    pub fn try_begin_check(&self, interval: Duration) -> bool {
        let mut inner = self.lock();
        if inner.checking {
            return false;
        }
        if let Some(last) = inner.last_check {
            if last.elapsed() < interval {
                return false;
            }
        }
        inner.checking = true;
        true
    }

    pub fn clear_checking(&self) {
        self.lock().checking = false;
    }

    pub fn is_checking(&self) -> bool {
        self.lock().checking
    }

    pub fn scoreboard(&self) -> BTreeMap<String, u64> {
        self.lock().scoreboard.clone()
    }

    pub fn nodeboard(&self) -> BTreeMap<String, u64> {
        self.lock().nodeboard.clone()
    }

    /// Records `team` as winner if `score` is at least the current
    /// highscore. Returns whether it was recorded.
    pub fn set_winner(&self, team: &str, score: u64) -> bool {
        let mut inner = self.lock();
        if score >= inner.highscore {
            inner.winner = Some(team.to_string());
            inner.highscore = score;
            return true;
        }
        false
    }

    pub fn winner(&self) -> Option<String> {
        self.lock().winner.clone()
    }

    pub fn highscore(&self) -> u64 {
        self.lock().highscore
    }

    /// Every team whose score reached the winning score.
    pub fn winners(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .scoreboard
            .iter()
            .filter(|(_, score)| **score >= self.config.winning_score)
            .map(|(team, _)| team.clone())
            .collect()
    }

    /// `true` once the game has ended or some team reached the winning score.
    pub fn winning_score_reached(&self) -> bool {
        self.status() == GameStatus::Ended || !self.winners().is_empty()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Checks the roster against the ruleset and returns the first
    /// violation in this order: min nodes, max nodes, min teams, max
    /// teams, required nodes, required teams.
    pub fn validate_nodes(&self) -> Result<()> {
        let inner = self.lock();
        let cfg = &self.config;
        let nodes = inner.nodes.len();
        let teams = inner.teams.len();

        if nodes < cfg.min_node_count {
            return Err(ArenaError::MinNodeCount {
                count: nodes,
                min: cfg.min_node_count,
            });
        }
        if nodes > cfg.max_node_count {
            return Err(ArenaError::MaxNodeCount {
                count: nodes,
                max: cfg.max_node_count,
            });
        }
        if teams < cfg.min_team_count {
            return Err(ArenaError::MinTeamCount {
                count: teams,
                min: cfg.min_team_count,
            });
        }
        if teams > cfg.max_team_count {
            return Err(ArenaError::MaxTeamCount {
                count: teams,
                max: cfg.max_team_count,
            });
        }
        for name in &cfg.required_node_names {
            if !inner.nodes.contains(name) {
                return Err(ArenaError::RequiredNode { name: name.clone() });
            }
        }
        for name in &cfg.required_team_names {
            if !inner.teams.contains(name) {
                return Err(ArenaError::RequiredTeam { name: name.clone() });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timeline and reporting
    // -----------------------------------------------------------------------

    /// Appends an event to the timeline.
    pub fn log_event(&self, event: GameEvent) {
        self.lock().timeline.push(TimelineEntry {
            at: Utc::now(),
            event,
        });
    }

    /// One-line summary for periodic logging.
    pub fn status_line(&self) -> String {
        let remaining = self.time_remaining();
        let inner = self.lock();
        format!(
            "status={} remaining={}s scoreboard={:?} nodeboard={:?}",
            inner.status,
            remaining.as_secs(),
            inner.scoreboard,
            inner.nodeboard,
        )
    }

    /// Copies the ledger for reporting and persistence.
    pub fn snapshot(&self) -> GameSnapshot {
        let inner = self.lock();
        GameSnapshot {
            status: inner.status,
            teams: inner.teams.clone(),
            nodes: inner.nodes.clone(),
            colors: inner.colors.clone(),
            scoreboard: inner.scoreboard.clone(),
            nodeboard: inner.nodeboard.clone(),
            winner: inner.winner.clone(),
            highscore: inner.highscore,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            game_duration_secs: inner.game_duration.as_secs(),
            last_check: inner.last_check_at,
            timeline: inner.timeline.clone(),
            config: self.config.clone(),
        }
    }
}

fn transition(inner: &mut Inner, next: GameStatus) -> Result<()> {
    if !inner.status.can_transition_to(next) {
        return Err(ArenaError::InvalidTransition {
            from: inner.status,
            to: next,
        });
    }
    inner.status = next;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
