//! Inbound cluster handler of a node.
//!
//! [`NodeDispatcher::handle`] applies one [`ClusterEvent`] to the local
//! [`NodeState`] and sensors and answers queries. It never waits: sensor
//! requests go through [`SensorHandle::try_send`], and a query that
//! cannot be answered is dropped (the asker sees no reply from us).
//!
//! | event                   | effect                                   |
//! |-------------------------|------------------------------------------|
//! | `game:mode`             | set mode                                 |
//! | `game:begin`/`game:end` | status Running / Ended                   |
//! | `game:teams`            | set roster (and colors with team colors) |
//! | `game:winner`           | record winner                            |
//! | `<node>:team:hit`       | count `<team>:<count>` hits              |
//! | `<node>:sensor:hit`     | ask `<sensor>` for `<count>` hits        |
//! | `<node>:sensor:color`   | set `<sensor>` to `<color>`              |

use std::collections::BTreeMap;
use std::sync::Arc;

use arena_cluster::{ClusterEvent, ClusterQuery};
use arena_types::protocol::{
    addressed_action, parse_hit, parse_sensor_color, GAME_BEGIN, GAME_END, GAME_MODE, GAME_TEAMS,
    GAME_WINNER, NODE_IS_READY, NODE_READY, NODE_SCOREBOARD, RANDOM_ID, SENSOR_COLOR, SENSOR_HIT,
    TEAM_HIT,
};
use arena_types::{ArenaError, GameStatus, Result};
use rand::seq::SliceRandom;

use crate::sensor::{SensorCommand, SensorHandle};
use crate::state::NodeState;

/// Applies cluster traffic to one node.
pub struct NodeDispatcher {
    state: Arc<NodeState>,
    sensors: BTreeMap<String, SensorHandle>,
    team_colors: bool,
}

impl NodeDispatcher {
    pub fn new(state: Arc<NodeState>, sensors: Vec<SensorHandle>, team_colors: bool) -> Self {
        let sensors = sensors
            .into_iter()
            .map(|s| (s.id().to_string(), s))
            .collect();
        Self {
            state,
            sensors,
            team_colors,
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Handles one inbound event or query.
    pub fn handle(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::User { name, payload } => {
                if let Err(e) = self.handle_user(&name, &payload) {
                    tracing::warn!(node = %self.state.name(), event = %name, %e, "cannot apply event");
                }
            }
            ClusterEvent::Query(query) => self.handle_query(query),
        }
    }

    fn handle_user(&self, name: &str, payload: &[u8]) -> Result<()> {
        let node = self.state.name();
        let text = String::from_utf8_lossy(payload);

        match name {
            GAME_MODE => {
                tracing::info!(%node, mode = %text, "set game mode");
                self.state.set_mode(&text);
            }
            GAME_BEGIN => {
                tracing::info!(%node, "game begins");
                self.state.set_status(GameStatus::Running);
            }
            GAME_END => {
                tracing::info!(%node, "game ended");
                self.state.set_status(GameStatus::Ended);
            }
            GAME_TEAMS => {
                tracing::info!(%node, teams = %text, "set game teams");
                self.state.set_teams(&text, self.team_colors);
            }
            GAME_WINNER => {
                tracing::info!(%node, winner = %text, "winning team announced");
                self.state.set_winner(&text);
            }
            _ => match addressed_action(name, node) {
                Some(action) => self.handle_action(action, payload)?,
                None => tracing::debug!(%node, event = %name, "ignoring event"),
            },
        }
        Ok(())
    }

    fn handle_action(&self, action: &str, payload: &[u8]) -> Result<()> {
        let node = self.state.name();
        match action {
            TEAM_HIT => {
                let (team, count) = parse_hit(payload)?;
                self.state.add_team_hit(&team, count)?;
                tracing::info!(%node, %team, count, "team hit");
            }
            SENSOR_HIT => {
                let (id, count) = parse_hit(payload)?;
                let sensor = self.resolve_sensor(&id)?;
                tracing::debug!(%node, sensor = %sensor.id(), count, "forwarding sensor hit");
                sensor.try_send(SensorCommand::Hit { count });
            }
            SENSOR_COLOR => {
                let (id, color) = parse_sensor_color(payload)?;
                let sensor = self.resolve_sensor(&id)?;
                let color = self.resolve_color(sensor, &color)?;
                tracing::debug!(%node, sensor = %sensor.id(), %color, "forwarding sensor color");
                sensor.try_send(SensorCommand::SetColor { color });
            }
            other => tracing::debug!(%node, action = %other, "unrecognized node action"),
        }
        Ok(())
    }

    fn handle_query(&self, query: ClusterQuery) {
        let answer = match query.name.as_str() {
            NODE_READY => NODE_IS_READY.as_bytes().to_vec(),
            GAME_MODE => self.state.mode().into_bytes(),
            NODE_SCOREBOARD => match self.state.hits_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(node = %self.state.name(), %e, "cannot encode hits");
                    return;
                }
            },
            other => {
                tracing::debug!(node = %self.state.name(), query = %other, "unrecognized query");
                return;
            }
        };

        if let Err(e) = query.respond(answer) {
            tracing::debug!(node = %self.state.name(), %e, "query answer not delivered");
        }
    }

    /// Looks a sensor up by id; `random` picks any local sensor.
    fn resolve_sensor(&self, id: &str) -> Result<&SensorHandle> {
        let found = if id == RANDOM_ID {
            let ids: Vec<&String> = self.sensors.keys().collect();
            ids.choose(&mut rand::thread_rng())
                .and_then(|id| self.sensors.get(*id))
        } else {
            self.sensors.get(id)
        };
        found.ok_or_else(|| ArenaError::UnknownSensor { id: id.to_string() })
    }

    /// Resolves `random` to a configured color. With more than one
    /// color the sensor's current color is never picked again.
    fn resolve_color(&self, sensor: &SensorHandle, color: &str) -> Result<String> {
        if color != RANDOM_ID {
            return Ok(color.to_string());
        }

        let colors = self.state.colors();
        let current = sensor.color();
        let candidates: Vec<&String> = if colors.len() > 1 {
            colors.iter().filter(|c| **c != current).collect()
        } else {
            colors.iter().collect()
        };

        candidates
            .choose(&mut rand::thread_rng())
            .map(|c| c.to_string())
            .ok_or_else(|| ArenaError::NoColor {
                reason: "no colors configured on this node".into(),
            })
    }
}
