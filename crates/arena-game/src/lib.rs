//! Game coordination for the arena cluster.
//!
//! The controlling process runs one [`engine::GameEngine`] behind a
//! [`controller::Controller`]. Everything in between travels over the
//! [`bus::EventBus`]:
//!
//! ```text
//! Game ──request──▶ GameEngine ──cluster──▶ Controller ──▶ ClusterUplink
//!   ▲                  │  ▲                     │
//!   └──────game────────┘  └──────query──────────┘
//! ```
//!
//! - [`state`]: the score ledger of the current game.
//! - [`scoreboard`]: aggregation of per-node hit maps.
//! - [`game`] / [`simulation`]: game modes and the mode registry.
//! - [`save`]: end-of-game log persistence and archive access.

pub mod bus;
pub mod command;
pub mod controller;
pub mod engine;
pub mod game;
pub mod save;
pub mod scoreboard;
pub mod simulation;
pub mod state;

pub use bus::{event_bus, BusReceivers, EventBus, GameQuery, GameQueryResponse};
pub use command::{EngineCommand, EngineHandle, EngineStatus};
pub use controller::Controller;
pub use engine::{EngineSettings, EngineStage, GameEngine};
pub use game::Game;
pub use state::{GameSnapshot, GameState};
