//! Game modes and the mode registry.
//!
//! A [`Game`] is a tagged variant per mode. New games are built through
//! the registry, which maps a mode name to a constructor; unknown modes
//! are rejected with `UnsupportedMode`.

use std::fmt;
use std::sync::Arc;

use arena_cluster::ShutdownSignal;
use arena_types::protocol::MODE_SIMULATION;
use arena_types::{ArenaError, GameEvent, Result};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};

use crate::bus::EventBus;
use crate::simulation::Simulation;

/// The engine → game queue, shared by successive games. The running
/// game holds the lock for its whole run.
pub type SharedGameReceiver = Arc<Mutex<mpsc::Receiver<GameEvent>>>;

type Constructor = fn(String) -> Game;

/// Mode name → constructor.
const REGISTRY: &[(&str, Constructor)] = &[(MODE_SIMULATION, build_simulation)];

fn build_simulation(id: String) -> Game {
    Game::Simulation(Simulation::new(id))
}

/// Mode names the registry can build.
pub fn supported_modes() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(mode, _)| *mode)
}

/// Fresh random game id, 16 bytes hex-encoded.
pub fn new_game_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

/// A mounted game.
#[derive(Clone, Debug)]
pub enum Game {
    Simulation(Simulation),
}

impl Game {
    /// Builds a new game for `mode` with a fresh id.
    pub fn new(mode: &str) -> Result<Self> {
        Self::with_id(mode, new_game_id())
    }

    /// Builds a new game for `mode` with the given id.
    pub fn with_id(mode: &str, id: String) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|(name, _)| *name == mode)
            .map(|(_, build)| build(id))
            .ok_or_else(|| ArenaError::UnsupportedMode {
                mode: mode.to_string(),
            })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Simulation(sim) => sim.id(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Simulation(_) => MODE_SIMULATION,
        }
    }

    /// Plays the game until the engine powers it off or shutdown fires.
    pub async fn run(
        self,
        bus: EventBus,
        game_rx: SharedGameReceiver,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        match self {
            Self::Simulation(sim) => sim.run(bus, game_rx, shutdown).await,
        }
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.mode(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arena_cluster::ShutdownTrigger;
    use arena_types::protocol::{GAME_OFF, RANDOM_TEAM_HIT};

    use crate::bus::event_bus;

    #[test]
    fn registry_builds_known_modes() -> Result<()> {
        let game = Game::new("simulation")?;
        assert_eq!(game.mode(), "simulation");
        assert_eq!(game.id().len(), 32);
        assert_eq!(supported_modes().collect::<Vec<_>>(), vec!["simulation"]);
        Ok(())
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(matches!(
            Game::new("capture-the-flag"),
            Err(ArenaError::UnsupportedMode { ref mode }) if mode == "capture-the-flag"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn simulation_requests_hits_until_powered_off() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (bus, mut rx) = event_bus(10);
        let game_rx: SharedGameReceiver = Arc::new(Mutex::new(rx.game_rx));
        let trigger = ShutdownTrigger::new();

        let game = Game::Simulation(Simulation::new("sim-1".into()).with_tick(Duration::from_secs(3)));
        let task = tokio::spawn(game.run(bus.clone(), Arc::clone(&game_rx), trigger.signal()));

        for _ in 0..2 {
            let event = rx.request_rx.recv().await.ok_or("request queue closed")?;
            assert_eq!(event.name, RANDOM_TEAM_HIT);
        }

        bus.send_to_game(GameEvent::bare(GAME_OFF)).await?;
        task.await??;

        // The queue is free for the next game.
        assert!(game_rx.try_lock().is_ok());
        Ok(())
    }
}
