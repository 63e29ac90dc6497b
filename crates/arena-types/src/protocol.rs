//! Wire names and payload codecs shared by the controller and nodes.
//!
//! Broadcast events and queries are identified by plain string names.
//! Node-directed broadcasts are addressed as `<node>:<action>` so that
//! only the named node acts on them. Payloads are colon-delimited text
//! tuples, comma-delimited lists, or JSON for the per-node hit map.

use std::collections::BTreeMap;

use crate::{ArenaError, Result};

// ---------------------------------------------------------------------------
// Separators
// ---------------------------------------------------------------------------

/// Separator for tuple payloads and node-addressed event names.
pub const SPLIT: &str = ":";

/// Separator for team-name lists.
pub const COMMA: &str = ",";

// ---------------------------------------------------------------------------
// Global broadcast events
// ---------------------------------------------------------------------------

/// Sets the game mode on every node (payload: mode name). Also the
/// name of the mode confirmation query.
pub const GAME_MODE: &str = "game:mode";

/// Game has begun; nodes start accepting hits.
pub const GAME_BEGIN: &str = "game:begin";

/// Game has ended; nodes stop accepting hits.
pub const GAME_END: &str = "game:end";

/// Local control signal from the engine telling the game to power off.
pub const GAME_OFF: &str = "game:off";

/// Team roster (payload: comma-delimited team names).
pub const GAME_TEAMS: &str = "game:teams";

/// Winning team announcement (payload: team name).
pub const GAME_WINNER: &str = "game:winner";

/// Timeline entry recording why a game failed.
pub const GAME_ERROR: &str = "game:error";

// ---------------------------------------------------------------------------
// Node-addressed actions (`<node>:<action>`)
// ---------------------------------------------------------------------------

/// Hits credited to a team (payload: `<team>:<count>`).
pub const TEAM_HIT: &str = "team:hit";

/// Synthetic sensor hit request (payload: `<sensor>:<count>`). Also the
/// name of a sensor's own hit report (payload: `<sensor>:<color>:<count>`).
pub const SENSOR_HIT: &str = "sensor:hit";

/// Sensor color change request (payload: `<sensor>:<color>`).
pub const SENSOR_COLOR: &str = "sensor:color";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Readiness query.
pub const NODE_READY: &str = "node:ready";

/// Reply to [`NODE_READY`] from a ready node.
pub const NODE_IS_READY: &str = "true";

/// Scoreboard query; nodes answer with their JSON hit map.
pub const NODE_SCOREBOARD: &str = "node:scoreboard";

// ---------------------------------------------------------------------------
// Request intents (game → engine)
// ---------------------------------------------------------------------------

/// Ask the engine for a random team hit on a random node.
pub const RANDOM_TEAM_HIT: &str = "random:team:hit";

/// Ask the engine for a synthetic hit on a random sensor of a random node.
pub const RANDOM_SENSOR_HIT: &str = "random:sensor:hit";

/// Ask the engine for a color change on a random sensor of a random node.
pub const RANDOM_SENSOR_COLOR: &str = "random:sensor:color";

// ---------------------------------------------------------------------------
// Operator actions (UI → controller)
// ---------------------------------------------------------------------------

/// Set the game mode on every node.
pub const UI_GAME_MODE: &str = "ui:game:mode";

/// End the running game.
pub const UI_GAME_END: &str = "ui:game:end";

// ---------------------------------------------------------------------------
// Well-known identifiers
// ---------------------------------------------------------------------------

/// Wildcard sensor id / color resolved by the receiving node.
pub const RANDOM_ID: &str = "random";

/// Sensor id credited for hits that did not come from a sensor.
pub const NONE_SENSOR_ID: &str = "none";

/// Color of a sensor whose light was never set.
pub const NO_COLOR: &str = "none";

/// Sensors whose id starts with this prefix have no hardware.
pub const TEST_SENSOR_PREFIX: &str = "test";

/// Built-in simulation game mode.
pub const MODE_SIMULATION: &str = "simulation";

// ---------------------------------------------------------------------------
// Node addressing
// ---------------------------------------------------------------------------

/// Builds a node-addressed event name, e.g. `alpha:team:hit`.
pub fn node_event_name(node: &str, action: &str) -> String {
    format!("{node}{SPLIT}{action}")
}

/// Returns the action part of `event` if it is addressed to `node`.
pub fn addressed_action<'a>(event: &'a str, node: &str) -> Option<&'a str> {
    event
        .strip_prefix(node)
        .and_then(|rest| rest.strip_prefix(SPLIT))
}

// ---------------------------------------------------------------------------
// Payload codecs
// ---------------------------------------------------------------------------

fn payload_text(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| ArenaError::InvalidPayload {
        reason: format!("payload is not utf-8: {e}"),
    })
}

fn parse_count(raw: &str, payload: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|e| ArenaError::InvalidPayload {
        reason: format!("cannot parse hit count from '{payload}': {e}"),
    })
}

/// Decodes a `<key>:<count>` payload (team hits, sensor hit requests).
pub fn parse_hit(payload: &[u8]) -> Result<(String, u64)> {
    let text = payload_text(payload)?;
    let mut parts = text.split(SPLIT);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(count), None) if !key.is_empty() => {
            Ok((key.to_string(), parse_count(count, text)?))
        }
        _ => Err(ArenaError::InvalidPayload {
            reason: format!("cannot parse hit from '{text}' - should be <key>:<count>"),
        }),
    }
}

/// Encodes a `<key>:<count>` payload.
pub fn encode_hit(key: &str, count: u64) -> Vec<u8> {
    format!("{key}{SPLIT}{count}").into_bytes()
}

/// Decodes a `<sensor>:<color>:<count>` payload.
pub fn parse_node_hit(payload: &[u8]) -> Result<(String, String, u64)> {
    let text = payload_text(payload)?;
    let parts: Vec<&str> = text.split(SPLIT).collect();
    if parts.len() != 3 {
        return Err(ArenaError::InvalidPayload {
            reason: format!(
                "cannot parse node hit from '{text}' - should be <sensor>:<color>:<count>"
            ),
        });
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parse_count(parts[2], text)?,
    ))
}

/// Encodes a `<sensor>:<color>:<count>` payload.
pub fn encode_node_hit(sensor: &str, color: &str, count: u64) -> Vec<u8> {
    format!("{sensor}{SPLIT}{color}{SPLIT}{count}").into_bytes()
}

/// Decodes a `<sensor>:<color>` payload.
pub fn parse_sensor_color(payload: &[u8]) -> Result<(String, String)> {
    let text = payload_text(payload)?;
    match text.split_once(SPLIT) {
        Some((sensor, color)) if !sensor.is_empty() && !color.is_empty() => {
            Ok((sensor.to_string(), color.to_string()))
        }
        _ => Err(ArenaError::InvalidPayload {
            reason: format!("cannot parse sensor color from '{text}' - should be <sensor>:<color>"),
        }),
    }
}

/// Encodes a `<sensor>:<color>` payload.
pub fn encode_sensor_color(sensor: &str, color: &str) -> Vec<u8> {
    format!("{sensor}{SPLIT}{color}").into_bytes()
}

/// Splits a comma-delimited team list, dropping empty entries.
pub fn parse_team_list(text: &str) -> Vec<String> {
    text.split(COMMA)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins team names with commas.
pub fn join_team_list(teams: &[String]) -> String {
    teams.join(COMMA)
}

/// Decodes a node's JSON hit map as returned by [`NODE_SCOREBOARD`].
pub fn parse_hit_map(payload: &[u8]) -> Result<BTreeMap<String, u64>> {
    serde_json::from_slice(payload).map_err(|e| ArenaError::InvalidPayload {
        reason: format!("cannot parse node hits: {e}"),
    })
}

/// Encodes a hit map as JSON.
pub fn encode_hit_map(hits: &BTreeMap<String, u64>) -> Result<Vec<u8>> {
    serde_json::to_vec(hits).map_err(|e| ArenaError::InvalidPayload {
        reason: format!("cannot encode node hits: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
