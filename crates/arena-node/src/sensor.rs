//! Sensor tasks.
//!
//! Each configured sensor runs one task that owns its command queue and
//! its current light color. Commands arrive from the dispatcher
//! (synthetic hits, color changes) and from the debounce task (accepted
//! hardware edges). Every hit is reported to the node as a
//! `sensor:hit` event with a `<sensor>:<color>:<count>` payload.
//!
//! Pin drivers are not part of this crate: a hardware layer feeds raw
//! edges through [`SensorHandle::edges`].

use arena_cluster::ShutdownSignal;
use arena_types::config::SensorConfig;
use arena_types::protocol::{encode_node_hit, SENSOR_HIT};
use arena_types::{ArenaError, GameEvent, Result};
use tokio::sync::{mpsc, watch};

use crate::debounce::{edge_queue, run_debounce, EdgeSender, HitDebouncer, RawEdge};

/// Commands accepted by a sensor task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SensorCommand {
    /// Report `count` hits in the current color.
    Hit { count: u64 },
    /// Switch the light to `color`.
    SetColor { color: String },
}

// ---------------------------------------------------------------------------
// SensorHandle
// ---------------------------------------------------------------------------

/// Cheap handle to a running sensor.
#[derive(Clone, Debug)]
pub struct SensorHandle {
    id: String,
    commands: mpsc::Sender<SensorCommand>,
    color: watch::Receiver<String>,
    edges: Option<EdgeSender>,
}

impl SensorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The color the light currently shows.
    pub fn color(&self) -> String {
        self.color.borrow().clone()
    }

    /// Raw edge input, if the sensor has a wired hit input.
    pub fn edges(&self) -> Option<&EdgeSender> {
        self.edges.as_ref()
    }

    /// Queues `command` without waiting. A full or closed queue drops
    /// the command with a warning and returns `false`.
    pub fn try_send(&self, command: SensorCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sensor = %self.id, command = ?e.into_inner(), "sensor queue unavailable, dropping command");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// A sensor task ready to run.
pub struct Sensor {
    config: SensorConfig,
    commands: mpsc::Receiver<SensorCommand>,
    command_tx: mpsc::Sender<SensorCommand>,
    color: watch::Sender<String>,
    hits: mpsc::Sender<GameEvent>,
    edges: Option<mpsc::Receiver<RawEdge>>,
}

impl Sensor {
    /// Builds a sensor whose hits go to `hits`.
    ///
    /// With `enable_hits` and a wired hit input the sensor also gets a
    /// raw edge queue and debounces it while running.
    pub fn new(
        config: SensorConfig,
        initial_color: &str,
        capacity: usize,
        hits: mpsc::Sender<GameEvent>,
        enable_hits: bool,
    ) -> (Self, SensorHandle) {
        let (command_tx, commands) = mpsc::channel(capacity.max(1));
        let (color, color_rx) = watch::channel(initial_color.to_string());

        let (edge_tx, edges) = if enable_hits && config.has_hit_input() {
            let (tx, rx) = edge_queue(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = SensorHandle {
            id: config.id.clone(),
            commands: command_tx.clone(),
            color: color_rx,
            edges: edge_tx,
        };
        let sensor = Self {
            config,
            commands,
            command_tx,
            color,
            hits,
            edges,
        };
        (sensor, handle)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Serves commands until shutdown, reported as `Err(Cancelled)`.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let Sensor {
            config,
            mut commands,
            command_tx,
            color,
            hits,
            edges,
        } = self;
        let id = config.id.clone();
        tracing::info!(sensor = %id, test = config.is_test(), "starting sensor");

        let mut debouncing = edges.is_some();
        let debounce = async {
            match edges {
                Some(rx) => {
                    let debouncer = HitDebouncer::new(config.debounce());
                    run_debounce(id.clone(), debouncer, rx, command_tx, shutdown.clone()).await
                }
                None => Ok(()),
            }
        };
        tokio::pin!(debounce);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!(sensor = %id, "stopping sensor");
                    return Err(ArenaError::Cancelled);
                }

                result = &mut debounce, if debouncing => {
                    debouncing = false;
                    result?;
                    tracing::info!(sensor = %id, "hit input closed");
                }

                Some(command) = commands.recv() => match command {
                    SensorCommand::Hit { count } => {
                        let current = color.borrow().clone();
                        report_hit(&hits, &id, &current, count);
                    }
                    SensorCommand::SetColor { color: next } => {
                        tracing::debug!(sensor = %id, color = %next, "setting sensor color");
                        color.send_replace(next);
                    }
                },
            }
        }
    }
}

fn report_hit(hits: &mpsc::Sender<GameEvent>, sensor: &str, color: &str, count: u64) {
    let event = GameEvent::new(SENSOR_HIT, encode_node_hit(sensor, color, count));
    match hits.try_send(event) {
        Ok(()) => tracing::debug!(%sensor, %color, count, "sensor hit"),
        Err(_) => tracing::warn!(%sensor, "node hit queue full, discarding sensor hit"),
    }
}
