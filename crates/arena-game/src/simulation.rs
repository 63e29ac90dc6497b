//! The built-in simulation game.
//!
//! Stands in for real players: every tick it asks the engine for a
//! random team hit on a random node, until the engine powers it off.

use std::time::Duration;

use arena_cluster::ShutdownSignal;
use arena_types::protocol::{GAME_OFF, RANDOM_TEAM_HIT};
use arena_types::{ArenaError, GameEvent, Result};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::bus::EventBus;
use crate::game::SharedGameReceiver;

/// Default pause between simulated hits.
pub const SIMULATION_TICK: Duration = Duration::from_secs(3);

/// Simulation game state.
#[derive(Clone, Debug)]
pub struct Simulation {
    id: String,
    tick: Duration,
}

impl Simulation {
    pub fn new(id: String) -> Self {
        Self {
            id,
            tick: SIMULATION_TICK,
        }
    }

    /// Overrides the hit cadence.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `game:off` arrives or shutdown is requested.
    pub(crate) async fn run(
        self,
        bus: EventBus,
        game_rx: SharedGameReceiver,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut events = game_rx.lock().await;
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(game = %self.id, "simulation started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!(game = %self.id, "simulation stopped by shutdown");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) if event.name == GAME_OFF => {
                        tracing::info!(game = %self.id, "simulation powered off");
                        return Ok(());
                    }
                    Some(event) => {
                        tracing::debug!(game = %self.id, %event, "simulation received event");
                    }
                    None => {
                        return Err(ArenaError::ChannelClosed {
                            reason: "game queue closed".into(),
                        });
                    }
                },
                _ = ticker.tick() => {
                    tracing::debug!(game = %self.id, "requesting random team hit");
                    tokio::select! {
                        sent = bus.request(GameEvent::bare(RANDOM_TEAM_HIT)) => sent?,
                        _ = shutdown.wait() => return Ok(()),
                    }
                }
            }
        }
    }
}
