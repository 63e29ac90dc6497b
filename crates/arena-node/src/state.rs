//! Local hit ledger of one node.
//!
//! [`NodeState`] lives for the whole process and is mutated only by the
//! node's dispatcher and its sensor hit reports. One hit updates three
//! counters (the node total, the sensor and the color) under a single
//! lock, so `hits[node] == Σ every accepted hit` at all times.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use arena_types::protocol::{encode_hit_map, parse_team_list, NONE_SENSOR_ID};
use arena_types::{ArenaError, GameStatus, Result};
use serde::Serialize;

/// Serializable copy of a [`NodeState`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub status: GameStatus,
    pub mode: String,
    pub teams: Vec<String>,
    pub colors: Vec<String>,
    pub winner: Option<String>,
    pub hits: BTreeMap<String, u64>,
}

struct Inner {
    status: GameStatus,
    mode: String,
    teams: Vec<String>,
    colors: Vec<String>,
    winner: Option<String>,
    hits: BTreeMap<String, u64>,
}

/// Status, roster and hit counters of the local node.
pub struct NodeState {
    name: String,
    inner: Mutex<Inner>,
}

impl NodeState {
    /// An `Init` node with no hits and the configured colors.
    pub fn new(name: impl Into<String>, colors: Vec<String>) -> Self {
        let name = name.into();
        let inner = Inner {
            status: GameStatus::Init,
            mode: String::new(),
            teams: Vec::new(),
            colors,
            winner: None,
            hits: BTreeMap::from([(name.clone(), 0)]),
        };
        Self {
            name,
            inner: Mutex::new(inner),
        }
    }

    // Every update is a plain field store, so a poisoned lock still
    // guards a consistent ledger.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> GameStatus {
        self.lock().status
    }

    /// Mirrors the controller's game status. Unlike the controller's
    /// ledger, a node may go from `Ended` back to `Running` for the next
    /// game.
    pub fn set_status(&self, status: GameStatus) {
        self.lock().status = status;
    }

    pub fn mode(&self) -> String {
        self.lock().mode.clone()
    }

    pub fn set_mode(&self, mode: &str) {
        self.lock().mode = mode.to_string();
    }

    pub fn teams(&self) -> Vec<String> {
        self.lock().teams.clone()
    }

    /// Applies a comma-delimited roster. With `team_colors` the roster
    /// also becomes the color list.
    pub fn set_teams(&self, roster: &str, team_colors: bool) {
        let teams = parse_team_list(roster);
        let mut inner = self.lock();
        if team_colors {
            inner.colors = teams.clone();
        }
        inner.teams = teams;
    }

    pub fn colors(&self) -> Vec<String> {
        self.lock().colors.clone()
    }

    pub fn winner(&self) -> Option<String> {
        self.lock().winner.clone()
    }

    pub fn set_winner(&self, team: &str) {
        self.lock().winner = Some(team.to_string());
    }

    /// Records `count` hits from `sensor` in `color`.
    ///
    /// # Errors
    ///
    /// `GameNotRunning` unless the node's game is running, and
    /// `InvalidPayload` if any counter would overflow. Either way nothing
    /// is counted.
    pub fn add_node_hit(&self, sensor: &str, color: &str, count: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.status != GameStatus::Running {
            return Err(ArenaError::GameNotRunning {
                status: inner.status,
            });
        }

        // Keys may coincide, so sum increments per key before checking.
        let mut updates: Vec<(&str, u64)> = Vec::with_capacity(3);
        for key in [self.name.as_str(), sensor, color] {
            match updates.iter_mut().find(|(k, _)| *k == key) {
                Some((_, inc)) => *inc = inc.saturating_add(count),
                None => updates.push((key, count)),
            }
        }

        let mut totals = Vec::with_capacity(updates.len());
        for (key, inc) in updates {
            let current = inner.hits.get(key).copied().unwrap_or(0);
            let total = current.checked_add(inc).ok_or_else(|| ArenaError::InvalidPayload {
                reason: format!("hit count {count} overflows the '{key}' counter"),
            })?;
            totals.push((key, total));
        }
        for (key, total) in totals {
            inner.hits.insert(key.to_string(), total);
        }
        Ok(())
    }

    /// Records `count` hits for `team` that did not come from a sensor.
    pub fn add_team_hit(&self, team: &str, count: u64) -> Result<()> {
        self.add_node_hit(NONE_SENSOR_ID, team, count)
    }

    pub fn hits(&self) -> BTreeMap<String, u64> {
        self.lock().hits.clone()
    }

    /// The hit map as the JSON answer to a scoreboard query.
    pub fn hits_json(&self) -> Result<Vec<u8>> {
        encode_hit_map(&self.hits())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let inner = self.lock();
        NodeSnapshot {
            name: self.name.clone(),
            status: inner.status,
            mode: inner.mode.clone(),
            teams: inner.teams.clone(),
            colors: inner.colors.clone(),
            winner: inner.winner.clone(),
            hits: inner.hits.clone(),
        }
    }
}
