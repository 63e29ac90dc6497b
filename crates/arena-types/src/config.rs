//! Process configuration and the per-game ruleset.
//!
//! [`ArenaConfig`] is the whole-process configuration, loaded once at
//! startup and validated before anything is spawned. Components never
//! receive it wholesale when a narrower slice will do: the engine gets a
//! [`GameConfig`], sensors get their own [`SensorConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{SPLIT, TEST_SENSOR_PREFIX};
use crate::{ArenaError, Result};

/// Default teams when none are configured.
pub const DEFAULT_TEAMS: [&str; 4] = ["blue", "red", "yellow", "green"];

/// Default per-sensor debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

// ---------------------------------------------------------------------------
// ArenaConfig
// ---------------------------------------------------------------------------

/// Process-wide configuration.
///
/// Every field has a default so a partial JSON file is enough.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Name this process uses as a cluster member.
    pub node_name: String,

    /// Run the controller (engine + uplink pump) in this process.
    pub enable_controller: bool,
    /// Run a node (dispatcher + sensors) in this process.
    pub enable_node: bool,
    /// Start the configured sensors on the node.
    pub enable_sensors: bool,
    /// Mount and start a simulation game as soon as the controller is up.
    pub enable_simulation: bool,
    /// Use the team roster as the node's sensor color palette.
    pub enable_team_colors: bool,

    /// Team names, in roster order.
    pub teams: Vec<String>,
    /// Node names expected to take part in a game.
    pub nodes: Vec<String>,
    /// Sensor color palette.
    pub colors: Vec<String>,

    /// Cluster members to join at startup.
    pub join_addrs: Vec<String>,
    /// Ask the transport to coalesce broadcasts with the same name.
    pub coalesce: bool,
    /// Tags every node advertises; queries from the engine filter on them.
    pub node_tags: BTreeMap<String, String>,
    /// Tags the controller advertises.
    pub controller_tags: BTreeMap<String, String>,

    /// Score at which a team wins outright.
    pub winning_score: u64,
    /// Game length, e.g. `"3m"` or `"1m30s"`.
    pub game_length: String,

    /// Pause between readiness polls while waiting for nodes (ms).
    pub ready_poll_ms: u64,
    /// Pause between attempts to get unanimous mode confirmation (ms).
    pub mode_retry_ms: u64,
    /// Minimum interval between scoreboard refreshes (ms).
    pub score_check_ms: u64,
    /// Engine idle tick (ms).
    pub engine_tick_ms: u64,
    /// Fan-out query timeout (ms).
    pub query_timeout_ms: u64,
    /// Pause between cluster join attempts (ms).
    pub join_retry_ms: u64,
    /// Capacity of every bounded in-process queue.
    pub channel_capacity: usize,

    /// Directory for end-of-game logs. `None` disables persistence.
    pub log_dir: Option<PathBuf>,

    /// Sensors hosted by this node.
    pub sensors: Vec<SensorConfig>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            enable_controller: false,
            enable_node: false,
            enable_sensors: false,
            enable_simulation: false,
            enable_team_colors: false,
            teams: DEFAULT_TEAMS.iter().map(|t| t.to_string()).collect(),
            nodes: Vec::new(),
            colors: Vec::new(),
            join_addrs: Vec::new(),
            coalesce: false,
            node_tags: BTreeMap::from([("role".to_string(), "node".to_string())]),
            controller_tags: BTreeMap::from([("role".to_string(), "controller".to_string())]),
            winning_score: 10,
            game_length: "3m".into(),
            ready_poll_ms: 10_000,
            mode_retry_ms: 1_000,
            score_check_ms: 10_000,
            engine_tick_ms: 1_000,
            query_timeout_ms: 5_000,
            join_retry_ms: 10_000,
            channel_capacity: 10,
            log_dir: Some(PathBuf::from("/data/logs")),
            sensors: Vec::new(),
        }
    }
}

impl ArenaConfig {
    /// Validates and normalizes the configuration.
    ///
    /// Team, node and color lists are deduplicated case-insensitively,
    /// keeping the first spelling and the original order.
    pub fn validate(&mut self) -> Result<()> {
        dedup_fold(&mut self.teams);
        dedup_fold(&mut self.nodes);
        dedup_fold(&mut self.colors);

        if self.node_name.trim().is_empty() {
            return Err(ArenaError::ConfigError {
                reason: "node_name must not be empty".into(),
            });
        }

        if self.winning_score == 0 {
            return Err(ArenaError::ConfigError {
                reason: "winning_score must be greater than 0".into(),
            });
        }

        parse_game_length(&self.game_length)?;

        if self.channel_capacity == 0 {
            return Err(ArenaError::ConfigError {
                reason: "channel_capacity must be greater than 0".into(),
            });
        }

        for (name, value) in [
            ("ready_poll_ms", self.ready_poll_ms),
            ("mode_retry_ms", self.mode_retry_ms),
            ("engine_tick_ms", self.engine_tick_ms),
            ("query_timeout_ms", self.query_timeout_ms),
            ("join_retry_ms", self.join_retry_ms),
        ] {
            if value == 0 {
                return Err(ArenaError::ConfigError {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }

        // Node name, sensor ids and hit colors share one hit map.
        if let Some(color) = self.hit_key_clash(&self.node_name) {
            return Err(ArenaError::ConfigError {
                reason: format!("node_name '{}' is also a team or color '{color}'", self.node_name),
            });
        }

        let mut seen = BTreeSet::new();
        for sensor in &self.sensors {
            sensor.validate()?;
            if !seen.insert(sensor.id.as_str()) {
                return Err(ArenaError::ConfigError {
                    reason: format!("duplicate sensor id '{}'", sensor.id),
                });
            }
            if sensor.id.eq_ignore_ascii_case(&self.node_name) {
                return Err(ArenaError::ConfigError {
                    reason: format!("sensor id '{}' equals the node name", sensor.id),
                });
            }
            if let Some(color) = self.hit_key_clash(&sensor.id) {
                return Err(ArenaError::ConfigError {
                    reason: format!("sensor id '{}' is also a team or color '{color}'", sensor.id),
                });
            }
        }

        Ok(())
    }

    fn hit_key_clash(&self, key: &str) -> Option<&str> {
        self.teams
            .iter()
            .chain(&self.colors)
            .find(|c| c.eq_ignore_ascii_case(key))
            .map(String::as_str)
    }

    /// Adds a node name if it is not already present.
    pub fn add_node(&mut self, name: &str) {
        if !self.nodes.iter().any(|n| n == name) {
            self.nodes.push(name.to_string());
        }
    }

    /// Adds a team name if it is not already present.
    pub fn add_team(&mut self, name: &str) {
        if !self.teams.iter().any(|t| t == name) {
            self.teams.push(name.to_string());
        }
    }

    /// Readiness poll interval.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    /// Mode confirmation retry interval.
    pub fn mode_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mode_retry_ms)
    }

    /// Scoreboard refresh interval.
    pub fn score_check_interval(&self) -> Duration {
        Duration::from_millis(self.score_check_ms)
    }

    /// Engine idle tick.
    pub fn engine_tick(&self) -> Duration {
        Duration::from_millis(self.engine_tick_ms)
    }

    /// Fan-out query timeout.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Cluster join retry interval.
    pub fn join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }
}

fn dedup_fold(items: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    items.retain(|item| seen.insert(item.to_lowercase()));
}

// ---------------------------------------------------------------------------
// GameConfig
// ---------------------------------------------------------------------------

/// Immutable ruleset for one game.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameConfig {
    /// Game length as configured, e.g. `"3m"`.
    pub game_length: String,
    /// Score at which a team wins.
    pub winning_score: u64,
    pub min_node_count: usize,
    pub max_node_count: usize,
    pub min_team_count: usize,
    pub max_team_count: usize,
    /// Nodes that must take part.
    pub required_node_names: BTreeSet<String>,
    /// Teams that must be on the roster.
    pub required_team_names: BTreeSet<String>,
    /// Initial team roster.
    pub teams: Vec<String>,
    /// Initial node list.
    pub nodes: Vec<String>,
    /// Color palette.
    pub colors: Vec<String>,
}

impl GameConfig {
    /// Derives the ruleset from process configuration.
    pub fn from_arena(cfg: &ArenaConfig) -> Self {
        Self {
            game_length: cfg.game_length.clone(),
            winning_score: cfg.winning_score,
            min_node_count: 3,
            max_node_count: 100,
            min_team_count: 3,
            max_team_count: 100,
            required_node_names: BTreeSet::new(),
            required_team_names: BTreeSet::new(),
            teams: cfg.teams.clone(),
            nodes: cfg.nodes.clone(),
            colors: cfg.colors.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SensorConfig
// ---------------------------------------------------------------------------

/// One hit sensor on a node. Pin descriptors are opaque strings handed
/// to the hardware layer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_gpiochip")]
    pub gpiochip: String,
    #[serde(default)]
    pub hit_pin: String,
    #[serde(default)]
    pub led_pin: String,
    #[serde(default)]
    pub led_count: u32,
    /// Debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_gpiochip() -> String {
    "gpiochip0".into()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl SensorConfig {
    /// A hardware-less sensor with defaults.
    pub fn test(id: &str) -> Self {
        Self {
            id: id.to_string(),
            device: String::new(),
            gpiochip: default_gpiochip(),
            hit_pin: String::new(),
            led_pin: String::new(),
            led_count: 0,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }

    /// Parses `<id>:<device>:<gpiochip>:<hit-pin>:<led-pin>[:<led-count>]`.
    ///
    /// Ids with the test prefix need nothing after the id.
    pub fn parse_flag(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.splitn(6, SPLIT).collect();
        let id = parts[0];

        if id.starts_with(TEST_SENSOR_PREFIX) {
            return Ok(Self::test(id));
        }

        if parts.len() < 5 {
            return Err(ArenaError::ConfigError {
                reason: format!(
                    "invalid sensor '{value}'; expects <id>:<device>:<gpiochip>:<hit-pin>:<led-pin>[:<led-count>]"
                ),
            });
        }

        let led_count = match parts.get(5) {
            Some(raw) => {
                let count: u32 = raw.parse().map_err(|e| ArenaError::ConfigError {
                    reason: format!("invalid led count '{raw}': {e}"),
                })?;
                if count < 2 {
                    return Err(ArenaError::ConfigError {
                        reason: format!("led count must be >= 2 for a strip, got {count}"),
                    });
                }
                count
            }
            None => 1,
        };

        Ok(Self {
            id: id.to_string(),
            device: parts[1].to_string(),
            gpiochip: parts[2].to_string(),
            hit_pin: parts[3].to_string(),
            led_pin: parts[4].to_string(),
            led_count,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        })
    }

    /// Test sensors have no hardware; hits only arrive as requests.
    pub fn is_test(&self) -> bool {
        self.id.starts_with(TEST_SENSOR_PREFIX)
    }

    /// Whether a hit input line is wired.
    pub fn has_hit_input(&self) -> bool {
        !self.is_test() && !self.hit_pin.is_empty()
    }

    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ArenaError::ConfigError {
                reason: "sensor id must not be empty".into(),
            });
        }
        if self.is_test() {
            return Ok(());
        }
        if self.device.is_empty() {
            return Err(ArenaError::ConfigError {
                reason: format!("sensor '{}' has no device", self.id),
            });
        }
        if self.hit_pin.is_empty() {
            return Err(ArenaError::ConfigError {
                reason: format!("sensor '{}' has no hit pin", self.id),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Game length
// ---------------------------------------------------------------------------

/// Parses a game length such as `"3m"`, `"90s"`, `"1h"` or `"1m30s"`.
///
/// Supported units: `h`, `m`, `s`, `ms`. A bare `"0"` is zero.
pub fn parse_game_length(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = |why: &str| ArenaError::ConfigError {
        reason: format!("invalid game length '{text}': {why}"),
    };

    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid("empty"));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid("missing unit"))?;
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn named() -> ArenaConfig {
        ArenaConfig {
            node_name: "ctrl".into(),
            ..ArenaConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        let mut config = named();
        assert!(config.validate().is_ok());
        assert_eq!(config.teams, vec!["blue", "red", "yellow", "green"]);
        assert_eq!(config.winning_score, 10);
        assert_eq!(config.game_length, "3m");
    }

    #[test]
    fn empty_node_name_rejected() {
        let mut config = ArenaConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_dedups_case_insensitively() -> Result<()> {
        let mut config = ArenaConfig {
            teams: vec!["Red".into(), "blue".into(), "red".into()],
            nodes: vec!["a".into(), "A".into(), "b".into()],
            ..named()
        };
        config.validate()?;
        assert_eq!(config.teams, vec!["Red", "blue"]);
        assert_eq!(config.nodes, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn bad_game_length_rejected() {
        let mut config = ArenaConfig {
            game_length: "three minutes".into(),
            ..named()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_sensor_ids_rejected() {
        let mut config = ArenaConfig {
            sensors: vec![SensorConfig::test("test1"), SensorConfig::test("test1")],
            ..named()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hit_key_collisions_rejected() {
        let wired = |id: &str| SensorConfig {
            id: id.to_string(),
            device: "dev0".into(),
            hit_pin: "17".into(),
            ..SensorConfig::test(id)
        };
        for sensor in [wired("ctrl"), wired("Red"), wired("white")] {
            let mut config = ArenaConfig {
                colors: vec!["white".into()],
                sensors: vec![sensor],
                ..named()
            };
            assert!(matches!(config.validate(), Err(ArenaError::ConfigError { .. })));
        }

        let mut config = ArenaConfig {
            node_name: "blue".into(),
            ..ArenaConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = ArenaConfig {
            colors: vec!["white".into()],
            sensors: vec![SensorConfig::test("test1"), wired("s1")],
            ..named()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn game_length_units() -> Result<()> {
        assert_eq!(parse_game_length("3m")?, Duration::from_secs(180));
        assert_eq!(parse_game_length("90s")?, Duration::from_secs(90));
        assert_eq!(parse_game_length("1h")?, Duration::from_secs(3600));
        assert_eq!(parse_game_length("1m30s")?, Duration::from_secs(90));
        assert_eq!(parse_game_length("250ms")?, Duration::from_millis(250));
        assert_eq!(parse_game_length("0")?, Duration::ZERO);
        assert!(parse_game_length("3").is_err());
        assert!(parse_game_length("m").is_err());
        assert!(parse_game_length("3d").is_err());
        assert!(parse_game_length("").is_err());
        Ok(())
    }

    #[test]
    fn game_config_defaults() {
        let game = GameConfig::from_arena(&named());
        assert_eq!(game.min_node_count, 3);
        assert_eq!(game.max_node_count, 100);
        assert_eq!(game.min_team_count, 3);
        assert_eq!(game.max_team_count, 100);
        assert!(game.required_node_names.is_empty());
        assert_eq!(game.winning_score, 10);
    }

    #[test]
    fn sensor_flag_parsing() -> Result<()> {
        let s = SensorConfig::parse_flag("s1:dev0:gpiochip1:17:18")?;
        assert_eq!(s.device, "dev0");
        assert_eq!(s.hit_pin, "17");
        assert_eq!(s.led_count, 1);
        assert_eq!(s.debounce(), Duration::from_millis(100));

        let strip = SensorConfig::parse_flag("s2:dev0:gpiochip1:17:18:30")?;
        assert_eq!(strip.led_count, 30);

        let test = SensorConfig::parse_flag("test9")?;
        assert!(test.is_test());
        assert!(!test.has_hit_input());

        assert!(SensorConfig::parse_flag("s3:dev0").is_err());
        assert!(SensorConfig::parse_flag("s4:dev0:chip:1:2:1").is_err());
        Ok(())
    }

    #[test]
    fn config_serde_partial_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config: ArenaConfig =
            serde_json::from_str(r#"{"node_name":"alpha","enable_node":true}"#)?;
        assert_eq!(config.node_name, "alpha");
        assert!(config.enable_node);
        assert_eq!(config.winning_score, 10);
        assert_eq!(config.node_tags.get("role").map(String::as_str), Some("node"));
        Ok(())
    }
}
