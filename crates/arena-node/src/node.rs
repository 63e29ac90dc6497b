//! Node runtime.
//!
//! A [`Node`] owns the local [`NodeState`], one task per configured
//! sensor and the dispatcher for its cluster uplink. After
//! [`Node::new`], call [`Node::start`] to spawn the task group:
//!
//! - the node loop: inbound cluster traffic → dispatcher, sensor hit
//!   reports → ledger,
//! - one task per sensor,
//! - the cluster join retry.
//!
//! The first task to fail stops the others; the group then leaves the
//! cluster.

use std::sync::Arc;
use std::time::Duration;

use arena_cluster::{
    join_with_retry, supervise, ClusterEvent, ClusterUplink, ShutdownSignal, ShutdownTrigger,
};
use arena_types::config::ArenaConfig;
use arena_types::protocol::{parse_node_hit, NO_COLOR, SENSOR_HIT};
use arena_types::{ArenaError, GameEvent, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::dispatcher::NodeDispatcher;
use crate::sensor::{Sensor, SensorHandle};
use crate::state::NodeState;

/// Components moved into the task group by [`Node::start`].
struct NodeRuntime {
    dispatcher: NodeDispatcher,
    sensors: Vec<Sensor>,
    hits_rx: mpsc::Receiver<GameEvent>,
}

/// One arena node.
pub struct Node {
    uplink: Arc<dyn ClusterUplink>,
    state: Arc<NodeState>,
    sensors: Vec<SensorHandle>,
    join_addrs: Vec<String>,
    join_retry: Duration,
    capacity: usize,
    /// `None` after `start()`.
    runtime: Option<NodeRuntime>,
}

impl Node {
    /// Builds the ledger, the sensors and the dispatcher from `config`.
    ///
    /// Sensors are only created with `enable_sensors`; their hit inputs
    /// are wired for every non-test sensor with a hit pin.
    ///
    /// # Errors
    ///
    /// `ConfigError` if `config` does not validate.
    pub fn new(config: &ArenaConfig, uplink: Arc<dyn ClusterUplink>) -> Result<Self> {
        let mut config = config.clone();
        config.validate()?;

        let state = Arc::new(NodeState::new(config.node_name.clone(), config.colors.clone()));
        let initial_color = config.colors.first().map_or(NO_COLOR, String::as_str);

        let (hits_tx, hits_rx) = mpsc::channel(config.channel_capacity);
        let mut sensors = Vec::new();
        let mut handles = Vec::new();
        if config.enable_sensors {
            for sensor_config in &config.sensors {
                let (sensor, handle) = Sensor::new(
                    sensor_config.clone(),
                    initial_color,
                    config.channel_capacity,
                    hits_tx.clone(),
                    true,
                );
                sensors.push(sensor);
                handles.push(handle);
            }
        } else if !config.sensors.is_empty() {
            tracing::info!(node = %config.node_name, "sensors disabled");
        }

        let dispatcher =
            NodeDispatcher::new(Arc::clone(&state), handles.clone(), config.enable_team_colors);

        Ok(Self {
            uplink,
            state,
            sensors: handles,
            join_addrs: config.join_addrs.clone(),
            join_retry: config.join_retry_interval(),
            capacity: config.channel_capacity,
            runtime: Some(NodeRuntime {
                dispatcher,
                sensors,
                hits_rx,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// The local ledger.
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Handles of the node's sensors.
    pub fn sensors(&self) -> &[SensorHandle] {
        &self.sensors
    }

    /// Spawns the node task group. Must be called inside a tokio runtime.
    ///
    /// The returned handle resolves with `Err(Cancelled)` after
    /// `shutdown`, or with the first error a task reported.
    pub fn start(&mut self, shutdown: &ShutdownSignal) -> Result<JoinHandle<Result<()>>> {
        let runtime = self.runtime.take().ok_or_else(|| ArenaError::ConfigError {
            reason: "node already started".into(),
        })?;

        let (handler_tx, handler_rx) = mpsc::channel(self.capacity);
        self.uplink.register_handler(handler_tx)?;

        let group = ShutdownTrigger::child_of(shutdown);
        let uplink = Arc::clone(&self.uplink);
        let join_addrs = self.join_addrs.clone();
        let join_retry = self.join_retry;

        let handle = tokio::spawn(async move {
            let NodeRuntime {
                dispatcher,
                sensors,
                hits_rx,
            } = runtime;
            let name = dispatcher.state().name().to_string();
            tracing::info!(node = %name, sensors = sensors.len(), "starting node");

            let mut tasks = JoinSet::new();
            for sensor in sensors {
                tasks.spawn(sensor.run(group.signal()));
            }
            tasks.spawn(run_node_loop(dispatcher, handler_rx, hits_rx, group.signal()));
            let join_uplink = Arc::clone(&uplink);
            let join_signal = group.signal();
            tasks.spawn(async move {
                join_with_retry(&*join_uplink, &join_addrs, join_retry, &join_signal)
                    .await
                    .map(|_| ())
            });

            let result = supervise(&mut tasks, &group).await;

            if let Err(e) = uplink.leave().await {
                tracing::warn!(node = %name, %e, "leaving cluster failed");
            }
            if let Err(e) = uplink.shutdown().await {
                tracing::warn!(node = %name, %e, "uplink shutdown failed");
            }
            tracing::info!(node = %name, "node stopped");
            result
        });

        Ok(handle)
    }
}

/// Feeds inbound cluster traffic to the dispatcher and sensor hit
/// reports to the ledger until shutdown.
async fn run_node_loop(
    dispatcher: NodeDispatcher,
    mut inbound: mpsc::Receiver<ClusterEvent>,
    mut hits: mpsc::Receiver<GameEvent>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let state = Arc::clone(dispatcher.state());
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!(node = %state.name(), "stopping node");
                return Err(ArenaError::Cancelled);
            }

            event = inbound.recv() => match event {
                Some(event) => dispatcher.handle(event),
                None => {
                    return Err(ArenaError::ClusterError {
                        reason: "cluster handler closed".into(),
                    });
                }
            },

            Some(event) = hits.recv() => apply_sensor_hit(&state, &event),
        }
    }
}

fn apply_sensor_hit(state: &NodeState, event: &GameEvent) {
    if event.name != SENSOR_HIT {
        tracing::debug!(node = %state.name(), %event, "ignoring sensor event");
        return;
    }
    let result = parse_node_hit(&event.payload)
        .and_then(|(sensor, color, count)| state.add_node_hit(&sensor, &color, count));
    if let Err(e) = result {
        tracing::info!(node = %state.name(), %e, "sensor hit not counted");
    }
}
