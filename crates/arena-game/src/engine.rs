//! Game lifecycle engine.
//!
//! The [`GameEngine`] owns the mounted [`Game`] and its [`GameState`] and
//! is driven by a single loop ([`GameEngine::run`]) that multiplexes:
//!
//! 1. **Commands**: `NewGame`, `StartGame`, `EndGame`, `Status` from the
//!    controller via [`EngineHandle`](crate::command::EngineHandle).
//! 2. **Requests**: action intents from the running game.
//! 3. **Tick**: periodic evaluation of expiry, score refresh and the
//!    winning score.
//! 4. **Shutdown**: cancellation, reported as `Err(Cancelled)`.
//!
//! # Stages
//!
//! ```text
//! Idle ──new_game──▶ Mounted ──start_game──▶ Running ──end_game──▶ Ended
//!   ▲                   │                       │
//!   └────fail_game──────┴───────────────────────┘  (via Failed)
//! ```
//!
//! A rule violation found when starting fails the game and resets the
//! engine to `Idle`; it is not an error for the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arena_cluster::ShutdownSignal;
use arena_types::config::{ArenaConfig, GameConfig};
use arena_types::protocol::{
    encode_hit, encode_sensor_color, node_event_name, GAME_BEGIN, GAME_END, GAME_MODE, GAME_OFF,
    GAME_TEAMS, GAME_WINNER, NODE_IS_READY, NODE_READY, NODE_SCOREBOARD, RANDOM_ID,
    RANDOM_SENSOR_COLOR, RANDOM_SENSOR_HIT, RANDOM_TEAM_HIT, SENSOR_COLOR, SENSOR_HIT, TEAM_HIT,
};
use arena_types::{ArenaError, GameEvent, GameStatus, Result};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::bus::EventBus;
use crate::command::{EngineCommand, EngineStatus};
use crate::game::{Game, SharedGameReceiver};
use crate::save::write_game_log;
use crate::scoreboard::{aggregate_scoreboard, Boards};
use crate::state::{GameSnapshot, GameState};

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

/// The slice of process configuration the engine needs.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Ready replies required before a game starts.
    pub expected_nodes: usize,
    /// Tags every engine query filters on.
    pub node_tags: BTreeMap<String, String>,
    /// Pause between readiness polls.
    pub ready_poll: Duration,
    /// Pause between mode confirmation attempts.
    pub mode_retry: Duration,
    /// Minimum interval between scoreboard refreshes.
    pub score_check: Duration,
    /// Idle tick of the engine loop.
    pub tick: Duration,
    /// Where end-of-game logs go; `None` disables them.
    pub log_dir: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_arena(cfg: &ArenaConfig) -> Self {
        Self {
            expected_nodes: cfg.nodes.len(),
            node_tags: cfg.node_tags.clone(),
            ready_poll: cfg.ready_poll_interval(),
            mode_retry: cfg.mode_retry_interval(),
            score_check: cfg.score_check_interval(),
            tick: cfg.engine_tick(),
            log_dir: cfg.log_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineStage
// ---------------------------------------------------------------------------

/// Lifecycle stage of the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStage {
    /// No game mounted.
    Idle,
    /// A game is mounted but not started.
    Mounted,
    /// The mounted game is running.
    Running,
    /// The mounted game has ended.
    Ended,
    /// The mounted game failed (transient; the engine resets to idle).
    Failed,
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Mounted => write!(f, "mounted"),
            Self::Running => write!(f, "running"),
            Self::Ended => write!(f, "ended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// GameEngine
// ---------------------------------------------------------------------------

/// Owns the current game and drives its lifecycle.
pub struct GameEngine {
    ruleset: GameConfig,
    settings: EngineSettings,
    bus: EventBus,
    game_rx: SharedGameReceiver,
    game: Option<Game>,
    state: Arc<GameState>,
    game_task: Option<JoinHandle<()>>,
}

impl GameEngine {
    /// Creates an idle engine. `game_rx` is the receiving end of the
    /// bus's game queue.
    pub fn new(
        ruleset: GameConfig,
        settings: EngineSettings,
        bus: EventBus,
        game_rx: mpsc::Receiver<GameEvent>,
    ) -> Self {
        let state = Arc::new(GameState::new(ruleset.clone()));
        Self {
            ruleset,
            settings,
            bus,
            game_rx: Arc::new(Mutex::new(game_rx)),
            game: None,
            state,
            game_task: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn stage(&self) -> EngineStage {
        if self.game.is_none() {
            return EngineStage::Idle;
        }
        match self.state.status() {
            GameStatus::Init => EngineStage::Mounted,
            GameStatus::Running => EngineStage::Running,
            GameStatus::Ended => EngineStage::Ended,
            GameStatus::Failed => EngineStage::Failed,
        }
    }

    /// `true` while a mounted game is running.
    pub fn in_progress(&self) -> bool {
        self.game.is_some() && self.state.is_running()
    }

    pub fn state(&self) -> &Arc<GameState> {
        &self.state
    }

    pub fn current_game(&self) -> Option<&Game> {
        self.game.as_ref()
    }

    /// Read access to the current ledger.
    pub fn snapshot(&self) -> GameSnapshot {
        self.state.snapshot()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            stage: self.stage(),
            mode: self.game.as_ref().map(|g| g.mode().to_string()),
            game_id: self.game.as_ref().map(|g| g.id().to_string()),
            game: self.snapshot(),
        }
    }

    // -----------------------------------------------------------------------
    // Mounting
    // -----------------------------------------------------------------------

    /// Builds a game for `mode` and mounts it.
    pub fn new_game(&mut self, mode: &str) -> Result<()> {
        if self.in_progress() {
            return Err(ArenaError::GameRunning);
        }
        let game = Game::new(mode)?;
        self.mount_game(game)
    }

    /// Mounts `game` with a fresh ledger, replacing any idle or finished
    /// game.
    pub fn mount_game(&mut self, game: Game) -> Result<()> {
        if self.in_progress() {
            return Err(ArenaError::GameRunning);
        }
        tracing::info!(%game, "mounting new game");
        self.state = Arc::new(GameState::new(self.ruleset.clone()));
        self.game = Some(game);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    /// Brings the mounted game to `Running`.
    ///
    /// Waits for ready nodes and unanimous mode confirmation (both
    /// retried until `shutdown`), sets the ledger up and validates the
    /// roster. A roster violation fails the game and returns `Ok`.
    pub async fn start_game(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        if self.in_progress() {
            return Err(ArenaError::GameRunning);
        }
        let game = self.game.clone().ok_or(ArenaError::NoGameMounted)?;
        if self.state.status() != GameStatus::Init {
            return Err(ArenaError::InvalidTransition {
                from: self.state.status(),
                to: GameStatus::Running,
            });
        }

        if let Err(e) = self.wait_for_nodes(self.settings.expected_nodes, shutdown).await {
            if e.is_cancelled() {
                return Err(e);
            }
            tracing::warn!(%e, "error waiting for game nodes");
            return Err(ArenaError::NodesNotReady {
                reason: e.to_string(),
            });
        }

        self.wait_for_mode_setup(game.mode(), shutdown).await?;
        self.state.setup()?;

        if let Err(e) = self.state.validate_nodes() {
            tracing::warn!(%e, "node/team configuration invalid, failing game");
            self.fail_game(&e)?;
            return Ok(());
        }

        tracing::info!(%game, status = %self.state.status_line(), "game running");
        self.state.log_event(GameEvent::new(GAME_BEGIN, game.mode()));
        self.bus
            .send_to_nodes(GameEvent::new(GAME_BEGIN, game.mode()))
            .await?;

        let bus = self.bus.clone();
        let game_rx = Arc::clone(&self.game_rx);
        let signal = shutdown.clone();
        if let Some(previous) = self.game_task.take() {
            previous.abort();
        }
        self.game_task = Some(tokio::spawn(async move {
            let name = game.to_string();
            if let Err(e) = game.run(bus, game_rx, signal).await {
                tracing::warn!(game = %name, %e, "game stopped with error");
            }
        }));
        Ok(())
    }

    /// Polls readiness until `expected` nodes answer "ready".
    ///
    /// Query errors are returned; too few replies sleep for the poll
    /// interval and retry. Returns the ready count.
    pub async fn wait_for_nodes(&self, expected: usize, shutdown: &ShutdownSignal) -> Result<usize> {
        tracing::info!(expected, "waiting for nodes to be ready");
        loop {
            let answers = self
                .bus
                .query(NODE_READY, b"", &self.settings.node_tags)
                .await?;
            let ready = answers
                .values()
                .filter(|v| v.as_slice() == NODE_IS_READY.as_bytes())
                .count();

            if ready >= expected {
                tracing::info!(ready, "nodes ready");
                return Ok(ready);
            }

            tracing::info!(ready, expected, "waiting for ready nodes");
            tokio::select! {
                _ = tokio::time::sleep(self.settings.ready_poll) => {}
                _ = shutdown.wait() => return Err(ArenaError::Cancelled),
            }
        }
    }

    /// Broadcasts `mode` and re-queries until every replying node
    /// confirms it, then broadcasts the team roster.
    ///
    /// Every replier is added to the roster. Retries until `shutdown`.
    pub async fn wait_for_mode_setup(&self, mode: &str, shutdown: &ShutdownSignal) -> Result<()> {
        tracing::info!(%mode, "setting game mode on nodes");
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.bus
                .send_to_nodes(GameEvent::new(GAME_MODE, mode))
                .await?;
            let answers = self
                .bus
                .query(GAME_MODE, b"", &self.settings.node_tags)
                .await?;

            let mut passed = 0;
            for (node, value) in &answers {
                self.state.add_node(node);
                if value.as_slice() == mode.as_bytes() {
                    passed += 1;
                } else {
                    tracing::info!(
                        %node,
                        got = %String::from_utf8_lossy(value),
                        want = %mode,
                        "node has not confirmed game mode"
                    );
                }
            }

            if passed > 0 && passed == answers.len() {
                tracing::info!(passed, attempt, "game mode confirmed by all nodes");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.mode_retry) => {}
                _ = shutdown.wait() => return Err(ArenaError::Cancelled),
            }
        }

        self.bus
            .send_to_nodes(GameEvent::new(GAME_TEAMS, self.state.team_list()))
            .await
    }

    // -----------------------------------------------------------------------
    // Ending
    // -----------------------------------------------------------------------

    /// Ends the running game: powers the game off, announces the end,
    /// collects the final score, picks and announces the winner, and
    /// persists the log.
    ///
    /// The winner is the first team in roster order whose score is
    /// strictly greater than every team before it; an all-zero
    /// scoreboard has no winner. Roster order rather than scoreboard
    /// order keeps ties going to the team listed first in the config.
    pub async fn end_game(&mut self) -> Result<()> {
        if !self.in_progress() {
            return Err(ArenaError::GameNotRunning {
                status: self.state.status(),
            });
        }

        self.state.end()?;
        self.state.log_event(GameEvent::new(GAME_END, "The game has ended."));
        if let Err(e) = self
            .bus
            .send_to_game(GameEvent::new(GAME_OFF, "turn off game"))
            .await
        {
            tracing::warn!(%e, "cannot power off game");
        }
        self.bus
            .send_to_nodes(GameEvent::new(GAME_END, "The game has ended."))
            .await?;

        let (scoreboard, nodeboard) = self.get_scoreboard().await?;
        self.state.set_boards(scoreboard.clone(), nodeboard);
        tracing::info!(?scoreboard, "final score");

        for team in self.state.teams() {
            if let Some(&count) = scoreboard.get(&team) {
                if count > self.state.highscore() {
                    self.state.set_winner(&team, count);
                }
            }
        }

        match self.state.winner() {
            Some(winner) => {
                tracing::info!(%winner, score = self.state.highscore(), "winning team");
                self.state.log_event(GameEvent::new(GAME_WINNER, winner.as_str()));
                self.bus
                    .send_to_nodes(GameEvent::new(GAME_WINNER, winner))
                    .await?;
            }
            None => tracing::info!("game ended without a winner"),
        }

        self.log_game();
        Ok(())
    }

    /// Marks the game failed, persists the log and resets to `Idle`.
    pub fn fail_game(&mut self, err: &ArenaError) -> Result<()> {
        self.state.fail(err)?;
        self.log_game();

        self.game = None;
        self.state = Arc::new(GameState::new(self.ruleset.clone()));
        Ok(())
    }

    /// Queries every node for its hit map and folds the answers into
    /// team and node totals.
    pub async fn get_scoreboard(&self) -> Result<Boards> {
        fetch_scoreboard(&self.bus, &self.state, &self.settings.node_tags).await
    }

    /// Writes the end-of-game log if a log dir is configured. Failures
    /// are logged; the ledger stays readable through [`snapshot`](Self::snapshot).
    fn log_game(&self) {
        let (Some(dir), Some(game)) = (&self.settings.log_dir, &self.game) else {
            return;
        };
        if let Err(e) = write_game_log(dir, game.mode(), game.id(), &self.state.snapshot()) {
            tracing::error!(%e, "could not write game log");
        }
    }

    // -----------------------------------------------------------------------
    // Random test actions
    // -----------------------------------------------------------------------

    /// Sends `hits` hits for a random team to a random node.
    pub async fn random_team_hit(&self, hits: u64) -> Result<()> {
        let (node, team) = match (self.state.random_node(), self.state.random_team()) {
            (Some(node), Some(team)) => (node, team),
            _ => {
                return Err(ArenaError::NodesNotReady {
                    reason: "no nodes or teams to pick from".into(),
                })
            }
        };
        self.bus
            .send_to_nodes(GameEvent::new(
                node_event_name(&node, TEAM_HIT),
                encode_hit(&team, hits),
            ))
            .await
    }

    /// Asks a random node for a synthetic hit on a random sensor.
    pub async fn random_sensor_hit(&self, hits: u64) -> Result<()> {
        let node = self.random_node()?;
        self.bus
            .send_to_nodes(GameEvent::new(
                node_event_name(&node, SENSOR_HIT),
                encode_hit(RANDOM_ID, hits),
            ))
            .await
    }

    /// Asks a random node to recolor a random sensor.
    pub async fn random_sensor_color(&self) -> Result<()> {
        let node = self.random_node()?;
        self.bus
            .send_to_nodes(GameEvent::new(
                node_event_name(&node, SENSOR_COLOR),
                encode_sensor_color(RANDOM_ID, RANDOM_ID),
            ))
            .await
    }

    fn random_node(&self) -> Result<String> {
        self.state
            .random_node()
            .ok_or_else(|| ArenaError::NodesNotReady {
                reason: "no nodes to pick from".into(),
            })
    }

    // -----------------------------------------------------------------------
    // Engine loop
    // -----------------------------------------------------------------------

    /// Runs the engine until shutdown (reported as `Err(Cancelled)`) or
    /// an unrecoverable error.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<GameEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        tracing::info!("game engine started");

        let mut tick = interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if let Err(e) = self.evaluate().await {
                break Err(e);
            }

            tokio::select! {
                biased;

                _ = shutdown.wait() => {
                    tracing::info!("stopping game engine");
                    break Err(ArenaError::Cancelled);
                }

                Some(command) = commands.recv() => {
                    self.handle_command(command, &shutdown).await;
                }

                Some(event) = requests.recv() => {
                    if let Err(e) = self.handle_request(event).await {
                        break Err(e);
                    }
                }

                _ = tick.tick() => {}
            }
        };

        if let Some(task) = self.game_task.take() {
            task.abort();
        }
        if let Err(e) = &result {
            if !e.is_cancelled() {
                tracing::error!(%e, "game engine failed");
            }
        }
        result
    }

    /// One evaluation pass over the running game.
    async fn evaluate(&mut self) -> Result<()> {
        if !self.in_progress() {
            return Ok(());
        }
        tracing::debug!(status = %self.state.status_line(), "game status");

        if self.state.time_expired() {
            tracing::info!("game time expired, ending game");
            return self.end_game().await;
        }

        if self.state.try_begin_check(self.settings.score_check) {
            self.spawn_score_refresh();
        }

        if self.state.winning_score_reached() {
            tracing::info!("winning score reached, ending game");
            return self.end_game().await;
        }
        Ok(())
    }

    fn spawn_score_refresh(&self) {
        tracing::debug!("checking on scores");
        let bus = self.bus.clone();
        let state = Arc::clone(&self.state);
        let tags = self.settings.node_tags.clone();
        tokio::spawn(async move {
            match fetch_scoreboard(&bus, &state, &tags).await {
                Ok((scoreboard, nodeboard)) => {
                    state.refresh_boards(scoreboard, nodeboard);
                }
                Err(e) => {
                    tracing::warn!(%e, "scoreboard refresh failed");
                    state.clear_checking();
                }
            }
        });
    }

    async fn handle_command(&mut self, command: EngineCommand, shutdown: &ShutdownSignal) {
        tracing::debug!(?command, "engine command");
        match command {
            EngineCommand::NewGame { mode, reply } => {
                let _ = reply.send(self.new_game(&mode));
            }
            EngineCommand::StartGame { reply } => {
                let result = self.start_game(shutdown).await;
                if let Err(e) = &result {
                    tracing::warn!(%e, "start game failed");
                }
                let _ = reply.send(result);
            }
            EngineCommand::EndGame { reply } => {
                let _ = reply.send(self.end_game().await);
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_request(&mut self, event: GameEvent) -> Result<()> {
        tracing::debug!(%event, "engine received request");
        match event.name.as_str() {
            GAME_BEGIN => {
                tracing::info!("relaying game begin to nodes");
                self.bus.send_to_nodes(event).await
            }
            GAME_END => {
                if self.in_progress() {
                    tracing::info!("end of game requested");
                    self.end_game().await
                } else {
                    tracing::info!("end requested with no game in progress");
                    Ok(())
                }
            }
            RANDOM_TEAM_HIT | RANDOM_SENSOR_HIT | RANDOM_SENSOR_COLOR if !self.in_progress() => {
                tracing::info!(request = %event.name, "ignoring request with no game in progress");
                Ok(())
            }
            RANDOM_TEAM_HIT => {
                let hits = rand::thread_rng().gen_range(1..=5);
                if let Err(e) = self.random_team_hit(hits).await {
                    tracing::warn!(%e, "cannot generate random team hit");
                }
                Ok(())
            }
            RANDOM_SENSOR_HIT => {
                if let Err(e) = self.random_sensor_hit(1).await {
                    tracing::warn!(%e, "cannot generate random sensor hit");
                }
                Ok(())
            }
            RANDOM_SENSOR_COLOR => {
                if let Err(e) = self.random_sensor_color().await {
                    tracing::warn!(%e, "cannot generate random sensor color");
                }
                Ok(())
            }
            other => {
                tracing::warn!(request = %other, "unsupported game request");
                Ok(())
            }
        }
    }
}

async fn fetch_scoreboard(
    bus: &EventBus,
    state: &GameState,
    tags: &BTreeMap<String, String>,
) -> Result<Boards> {
    let answers = bus.query(NODE_SCOREBOARD, b"", tags).await?;
    Ok(aggregate_scoreboard(&answers, &state.teams(), &state.nodes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use arena_cluster::ShutdownTrigger;
    use tokio::sync::oneshot;

    use crate::bus::{event_bus, BusReceivers, GameQuery, GameQueryResponse};

    fn config_with(nodes: &[&str]) -> ArenaConfig {
        ArenaConfig {
            node_name: "ctrl".into(),
            teams: vec!["red".into(), "blue".into(), "green".into()],
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            log_dir: None,
            ..ArenaConfig::default()
        }
    }

    fn engine_with(nodes: &[&str]) -> (GameEngine, BusReceivers) {
        engine_from(config_with(nodes))
    }

    fn engine_from(cfg: ArenaConfig) -> (GameEngine, BusReceivers) {
        let (bus, mut rx) = event_bus(16);
        let game_rx = std::mem::replace(&mut rx.game_rx, mpsc::channel(1).1);
        let engine = GameEngine::new(
            GameConfig::from_arena(&cfg),
            EngineSettings::from_arena(&cfg),
            bus,
            game_rx,
        );
        (engine, rx)
    }

    #[test]
    fn new_game_mounts_and_rejects_unknown_mode() -> Result<()> {
        let (mut engine, _rx) = engine_with(&["a", "b", "c"]);
        assert_eq!(engine.stage(), EngineStage::Idle);

        assert!(matches!(
            engine.new_game("tag"),
            Err(ArenaError::UnsupportedMode { .. })
        ));
        engine.new_game("simulation")?;
        assert_eq!(engine.stage(), EngineStage::Mounted);
        assert_eq!(engine.status().mode.as_deref(), Some("simulation"));

        // A mounted but idle game may be replaced.
        engine.new_game("simulation")?;
        Ok(())
    }

    #[test]
    fn new_game_rejected_while_running() -> Result<()> {
        let (mut engine, _rx) = engine_with(&["a", "b", "c"]);
        engine.new_game("simulation")?;
        engine.state().setup()?;
        assert!(engine.in_progress());
        assert!(matches!(engine.new_game("simulation"), Err(ArenaError::GameRunning)));
        Ok(())
    }

    #[tokio::test]
    async fn start_without_game_is_rejected() {
        let (mut engine, _rx) = engine_with(&[]);
        let trigger = ShutdownTrigger::new();
        assert!(matches!(
            engine.start_game(&trigger.signal()).await,
            Err(ArenaError::NoGameMounted)
        ));
    }

    #[test]
    fn fail_game_resets_to_idle() -> Result<()> {
        let (mut engine, _rx) = engine_with(&["a"]);
        engine.new_game("simulation")?;
        engine.fail_game(&ArenaError::MinNodeCount { count: 1, min: 3 })?;
        assert_eq!(engine.stage(), EngineStage::Idle);
        assert_eq!(engine.snapshot().status, GameStatus::Init);
        engine.new_game("simulation")?;
        Ok(())
    }

    #[tokio::test]
    async fn end_game_picks_strictly_greater_in_roster_order() -> Result<()> {
        let (mut engine, mut rx) = engine_with(&["alpha", "beta"]);
        engine.new_game("simulation")?;
        engine.state().setup()?;

        let pump = tokio::spawn(async move {
            while let Some(query) = rx.query_rx.recv().await {
                let answers = HashMap::from([
                    ("alpha".to_string(), br#"{"alpha":15,"red":12,"blue":3}"#.to_vec()),
                    ("beta".to_string(), br#"{"beta":9,"blue":6,"green":3,"s1":9}"#.to_vec()),
                ]);
                query.respond(GameQueryResponse::ok(answers));
            }
            rx
        });

        engine.end_game().await?;
        let state = engine.state();
        assert_eq!(state.status(), GameStatus::Ended);
        assert_eq!(state.winner().as_deref(), Some("red"));
        assert_eq!(state.highscore(), 12);
        assert_eq!(state.scoreboard().get("blue"), Some(&9));
        assert_eq!(state.nodeboard().get("alpha"), Some(&15));

        drop(engine);
        let mut rx = pump.await.map_err(|e| ArenaError::ChannelClosed {
            reason: e.to_string(),
        })?;
        let sent: Vec<String> = std::iter::from_fn(|| rx.cluster_rx.try_recv().ok())
            .map(|e| e.name)
            .collect();
        assert_eq!(sent, vec![GAME_END.to_string(), GAME_WINNER.to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn all_zero_scoreboard_has_no_winner() -> Result<()> {
        let (mut engine, mut rx) = engine_with(&["alpha"]);
        engine.new_game("simulation")?;
        engine.state().setup()?;

        tokio::spawn(async move {
            while let Some(query) = rx.query_rx.recv().await {
                let answers =
                    HashMap::from([("alpha".to_string(), br#"{"alpha":0,"red":0}"#.to_vec())]);
                query.respond(GameQueryResponse::ok(answers));
            }
        });

        engine.end_game().await?;
        assert_eq!(engine.state().winner(), None);
        assert_eq!(engine.state().highscore(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn end_game_requires_running_game() {
        let (mut engine, _rx) = engine_with(&["alpha"]);
        assert!(matches!(
            engine.end_game().await,
            Err(ArenaError::GameNotRunning { .. })
        ));
    }

    /// Answers every query with one node's fixed hit map and counts the
    /// scoreboard queries.
    fn answer_queries(
        mut queries: mpsc::Receiver<GameQuery>,
        hits: &'static [u8],
    ) -> Arc<AtomicUsize> {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        tokio::spawn(async move {
            while let Some(query) = queries.recv().await {
                if query.name == NODE_SCOREBOARD {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                let answers = HashMap::from([("alpha".to_string(), hits.to_vec())]);
                query.respond(GameQueryResponse::ok(answers));
            }
        });
        asked
    }

    async fn status_of(commands: &mpsc::Sender<EngineCommand>) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        commands
            .send(EngineCommand::Status { reply })
            .await
            .map_err(|_| ArenaError::Cancelled)?;
        rx.await.map_err(|_| ArenaError::Cancelled)
    }

    /// Mounts and sets up a game, then spawns the engine loop.
    fn run_engine(
        cfg: ArenaConfig,
        hits: &'static [u8],
    ) -> Result<(
        mpsc::Sender<EngineCommand>,
        Arc<AtomicUsize>,
        ShutdownTrigger,
        JoinHandle<Result<()>>,
        BusReceivers,
    )> {
        let (mut engine, mut rx) = engine_from(cfg);
        engine.new_game("simulation")?;
        engine.state().setup()?;

        let queries = std::mem::replace(&mut rx.query_rx, mpsc::channel(1).1);
        let requests = std::mem::replace(&mut rx.request_rx, mpsc::channel(1).1);
        let asked = answer_queries(queries, hits);
        let (commands_tx, commands_rx) = mpsc::channel(4);
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(engine.run(requests, commands_rx, trigger.signal()));
        Ok((commands_tx, asked, trigger, task, rx))
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ends_game_when_time_runs_out() -> Result<()> {
        let cfg = ArenaConfig {
            game_length: "5s".into(),
            ..config_with(&["alpha"])
        };
        let (commands, _asked, trigger, task, _rx) =
            run_engine(cfg, br#"{"alpha":3,"red":3}"#)?;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(status_of(&commands).await?.stage, EngineStage::Running);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = status_of(&commands).await?;
        assert_eq!(status.stage, EngineStage::Ended);
        assert_eq!(status.game.winner.as_deref(), Some("red"));
        assert_eq!(status.game.highscore, 3);

        trigger.trigger();
        let result = task.await.map_err(|e| ArenaError::ChannelClosed {
            reason: e.to_string(),
        })?;
        assert!(matches!(result, Err(ArenaError::Cancelled)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ends_game_on_winning_score() -> Result<()> {
        let cfg = ArenaConfig {
            winning_score: 10,
            ..config_with(&["alpha"])
        };
        let (commands, asked, trigger, _task, _rx) =
            run_engine(cfg, br#"{"alpha":13,"red":11,"blue":2}"#)?;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = status_of(&commands).await?;
        assert_eq!(status.stage, EngineStage::Ended);
        assert_eq!(status.game.winner.as_deref(), Some("red"));
        assert_eq!(status.game.scoreboard.get("red"), Some(&11));
        // One refresh while running plus the final count.
        assert_eq!(asked.load(Ordering::SeqCst), 2);
        trigger.trigger();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn loop_refreshes_at_most_once_per_score_check() -> Result<()> {
        let cfg = ArenaConfig {
            score_check_ms: 10_000,
            engine_tick_ms: 1_000,
            ..config_with(&["alpha"])
        };
        let (commands, asked, trigger, _task, _rx) =
            run_engine(cfg, br#"{"alpha":2,"red":2}"#)?;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        let status = status_of(&commands).await?;
        assert_eq!(status.stage, EngineStage::Running);
        assert_eq!(status.game.scoreboard.get("red"), Some(&2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(asked.load(Ordering::SeqCst), 2);
        trigger.trigger();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn end_game_waits_for_room_to_power_off_game() -> Result<()> {
        let (mut engine, mut rx) = engine_with(&["alpha"]);
        engine.new_game("simulation")?;
        engine.state().setup()?;

        let game_rx = Arc::clone(&engine.game_rx);
        for _ in 0..16 {
            engine
                .bus
                .send_to_game(GameEvent::bare(RANDOM_TEAM_HIT))
                .await?;
        }
        let queries = std::mem::replace(&mut rx.query_rx, mpsc::channel(1).1);
        answer_queries(queries, br#"{"alpha":1,"red":1}"#);

        let ending = tokio::spawn(async move {
            let ended = engine.end_game().await;
            ended.map(|()| engine)
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!ending.is_finished());

        let mut events = game_rx.lock().await;
        assert!(events.recv().await.is_some());
        let engine = ending.await.map_err(|e| ArenaError::ChannelClosed {
            reason: e.to_string(),
        })??;
        assert_eq!(engine.state().status(), GameStatus::Ended);

        let queued: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name)
            .collect();
        assert_eq!(queued.len(), 16);
        assert_eq!(queued.last().map(String::as_str), Some(GAME_OFF));
        Ok(())
    }
}
