//! Composition root on the controlling process.
//!
//! A [`Controller`] owns the event bus, the [`GameEngine`] and one
//! [`ClusterUplink`]. [`Controller::start`] spawns one task group:
//!
//! - the engine loop,
//! - the uplink pump (cluster queue → `broadcast`, query queue → `query`),
//! - the cluster join retry,
//! - the inbound handler (the controller only observes cluster traffic).
//!
//! The first task to fail cancels its siblings through a child shutdown
//! trigger; the group then leaves the cluster and reports that error.

use std::sync::Arc;
use std::time::Duration;

use arena_cluster::{
    join_with_retry, supervise, ClusterEvent, ClusterUplink, QueryParams, ShutdownSignal,
    ShutdownTrigger,
};
use arena_types::config::{ArenaConfig, GameConfig};
use arena_types::protocol::{
    GAME_END, GAME_MODE, RANDOM_SENSOR_COLOR, RANDOM_SENSOR_HIT, RANDOM_TEAM_HIT, UI_GAME_END,
    UI_GAME_MODE,
};
use arena_types::{ArenaError, GameEvent, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::bus::{event_bus, EventBus, GameQuery, GameQueryResponse};
use crate::command::{EngineCommand, EngineHandle};
use crate::engine::{EngineSettings, EngineStage, GameEngine};

/// Capacity of the engine command queue.
const COMMAND_CHANNEL_SIZE: usize = 16;

/// Pieces moved into the task group by [`Controller::start`].
struct ControllerRuntime {
    engine: GameEngine,
    request_rx: mpsc::Receiver<GameEvent>,
    command_rx: mpsc::Receiver<EngineCommand>,
    cluster_rx: mpsc::Receiver<GameEvent>,
    query_rx: mpsc::Receiver<GameQuery>,
}

/// Settings for the uplink side of the controller.
#[derive(Clone, Debug)]
struct UplinkSettings {
    join_addrs: Vec<String>,
    join_retry: Duration,
    coalesce: bool,
    query_timeout: Duration,
    handler_capacity: usize,
}

/// Ties the engine, the event bus and the cluster uplink together.
pub struct Controller {
    uplink: Arc<dyn ClusterUplink>,
    bus: EventBus,
    engine: EngineHandle,
    settings: UplinkSettings,
    /// `None` after `start()`.
    runtime: Option<ControllerRuntime>,
}

impl Controller {
    /// Builds the bus and an idle engine from `config`.
    ///
    /// # Errors
    ///
    /// `ConfigError` if `config` does not validate.
    pub fn new(config: &ArenaConfig, uplink: Arc<dyn ClusterUplink>) -> Result<Self> {
        let mut config = config.clone();
        config.validate()?;

        let (bus, receivers) = event_bus(config.channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let engine = GameEngine::new(
            GameConfig::from_arena(&config),
            EngineSettings::from_arena(&config),
            bus.clone(),
            receivers.game_rx,
        );

        let runtime = ControllerRuntime {
            engine,
            request_rx: receivers.request_rx,
            command_rx,
            cluster_rx: receivers.cluster_rx,
            query_rx: receivers.query_rx,
        };

        Ok(Self {
            uplink,
            bus,
            engine: EngineHandle::new(command_tx),
            settings: UplinkSettings {
                join_addrs: config.join_addrs.clone(),
                join_retry: config.join_retry_interval(),
                coalesce: config.coalesce,
                query_timeout: config.query_timeout(),
                handler_capacity: config.channel_capacity,
            },
            runtime: Some(runtime),
        })
    }

    /// Client for the engine loop.
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Sending side of the event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Spawns the controller task group. Must be called inside a tokio
    /// runtime.
    ///
    /// The returned handle resolves when the group stops: `Err(Cancelled)`
    /// after `shutdown`, or the first error a task reported.
    ///
    /// # Errors
    ///
    /// - `ConfigError` on a second call.
    /// - Any error from registering the inbound handler.
    pub fn start(&mut self, shutdown: &ShutdownSignal) -> Result<JoinHandle<Result<()>>> {
        let runtime = self.runtime.take().ok_or_else(|| ArenaError::ConfigError {
            reason: "controller already started".into(),
        })?;

        let (handler_tx, handler_rx) = mpsc::channel(self.settings.handler_capacity.max(1));
        self.uplink.register_handler(handler_tx)?;

        let group = ShutdownTrigger::child_of(shutdown);
        let uplink = Arc::clone(&self.uplink);
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            let ControllerRuntime {
                engine,
                request_rx,
                command_rx,
                cluster_rx,
                query_rx,
            } = runtime;

            let mut tasks = JoinSet::new();
            tasks.spawn(engine.run(request_rx, command_rx, group.signal()));
            tasks.spawn(run_uplink_pump(
                Arc::clone(&uplink),
                cluster_rx,
                query_rx,
                settings.clone(),
                group.signal(),
            ));
            tasks.spawn(run_join(Arc::clone(&uplink), settings, group.signal()));
            tasks.spawn(run_inbound(handler_rx, group.signal()));

            let result = supervise(&mut tasks, &group).await;

            if let Err(e) = uplink.leave().await {
                tracing::warn!(%e, "leaving cluster failed");
            }
            if let Err(e) = uplink.shutdown().await {
                tracing::warn!(%e, "uplink shutdown failed");
            }
            tracing::info!(member = %uplink.local_name(), "controller stopped");
            result
        });

        Ok(handle)
    }

    /// Mounts a game of `mode` and starts it.
    pub async fn play(&self, mode: &str) -> Result<()> {
        self.engine.new_game(mode).await?;
        self.engine.start_game().await
    }

    /// Dispatches an operator action.
    ///
    /// `ui:game:mode` broadcasts the mode-set event (rejected while a
    /// game runs), `ui:game:end` and the random test actions are queued
    /// for the engine. Anything else is `ActionNotAllowed`.
    pub async fn action(&self, name: &str, payload: &[u8]) -> Result<()> {
        tracing::info!(action = %name, "operator action");
        match name {
            UI_GAME_MODE => {
                if self.engine.status().await?.stage == EngineStage::Running {
                    return Err(ArenaError::GameRunning);
                }
                self.bus
                    .send_to_nodes(GameEvent::new(GAME_MODE, payload))
                    .await
            }
            UI_GAME_END => self.bus.request(GameEvent::new(GAME_END, payload)).await,
            RANDOM_TEAM_HIT | RANDOM_SENSOR_HIT | RANDOM_SENSOR_COLOR => {
                self.bus.request(GameEvent::new(name, payload)).await
            }
            other => Err(ArenaError::ActionNotAllowed {
                action: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Task group
// ---------------------------------------------------------------------------

async fn run_join(
    uplink: Arc<dyn ClusterUplink>,
    settings: UplinkSettings,
    shutdown: ShutdownSignal,
) -> Result<()> {
    join_with_retry(&*uplink, &settings.join_addrs, settings.join_retry, &shutdown)
        .await
        .map(|_| ())
}

/// Drains the cluster queue into broadcasts and the query queue into
/// fan-out queries. Every query gets its own task and its response slot
/// is filled exactly once.
async fn run_uplink_pump(
    uplink: Arc<dyn ClusterUplink>,
    mut cluster_rx: mpsc::Receiver<GameEvent>,
    mut query_rx: mpsc::Receiver<GameQuery>,
    settings: UplinkSettings,
    shutdown: ShutdownSignal,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return Err(ArenaError::Cancelled),

            Some(event) = cluster_rx.recv() => {
                tracing::debug!(%event, "broadcasting");
                if let Err(e) = uplink
                    .broadcast(&event.name, &event.payload, settings.coalesce)
                    .await
                {
                    tracing::warn!(event = %event.name, %e, "broadcast failed");
                }
            }

            Some(query) = query_rx.recv() => {
                let uplink = Arc::clone(&uplink);
                let params = QueryParams::new(settings.query_timeout).with_tags(query.tags.clone());
                tokio::spawn(async move {
                    let response = match uplink.query(&query.name, &query.payload, &params).await {
                        Ok(answers) => GameQueryResponse::ok(answers),
                        Err(e) => {
                            tracing::warn!(query = %query.name, %e, "query failed");
                            GameQueryResponse::failed(e)
                        }
                    };
                    query.respond(response);
                });
            }
        }
    }
}

/// The controller hosts no sensors; inbound traffic is only logged and
/// queries go unanswered.
async fn run_inbound(mut rx: mpsc::Receiver<ClusterEvent>, shutdown: ShutdownSignal) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return Err(ArenaError::Cancelled),
            event = rx.recv() => match event {
                Some(ClusterEvent::User { name, payload }) => {
                    tracing::debug!(
                        event = %name,
                        payload = %String::from_utf8_lossy(&payload),
                        "controller observed event"
                    );
                }
                Some(ClusterEvent::Query(query)) => {
                    tracing::debug!(query = %query.name, "controller ignores query");
                }
                None => return Ok(()),
            },
        }
    }
}
