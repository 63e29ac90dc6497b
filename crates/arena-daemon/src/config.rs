//! CLI argument parsing and config file support.
//!
//! The daemon is configured by an optional JSON file holding an
//! `ArenaConfig`, with CLI flags layered on top. Join addresses fall
//! back to `ARENA_JOIN_ADDRS` when neither source names any.

use std::path::{Path, PathBuf};

use arena_types::config::{ArenaConfig, SensorConfig};

/// Env var consulted when no join address was configured.
pub const JOIN_ADDRS_ENV: &str = "ARENA_JOIN_ADDRS";

const DEFAULT_NODE_NAME: &str = "arena";

// ---------------------------------------------------------------------------
// CLI arguments (manual parsing, no clap dependency)
// ---------------------------------------------------------------------------

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub name: Option<String>,
    pub controller: bool,
    pub node: bool,
    pub simulation: bool,
    pub join_addrs: Vec<String>,
    pub sensors: Vec<String>,
    pub log_dir: Option<PathBuf>,
    pub teams: Vec<String>,
    pub node_names: Vec<String>,
    pub help: bool,
}

impl CliArgs {
    /// Parses `std::env::args`, exiting on `--help` or a bad flag.
    pub fn parse_from_env() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        match Self::parse(&args) {
            Ok(cli) if cli.help => {
                print_help();
                std::process::exit(0);
            }
            Ok(cli) => cli,
            Err(e) => {
                eprintln!("{e}");
                eprintln!("use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    /// Parses `args` (without the program name).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut cli = Self::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .ok_or_else(|| format!("missing value for {arg}"))
            };
            match arg.as_str() {
                "--config" => cli.config_path = Some(PathBuf::from(value()?)),
                "--name" => cli.name = Some(value()?),
                "--controller" => cli.controller = true,
                "--node" => cli.node = true,
                "--simulation" => cli.simulation = true,
                "--join" => cli.join_addrs.push(value()?),
                "--sensor" => cli.sensors.push(value()?),
                "--logdir" => cli.log_dir = Some(PathBuf::from(value()?)),
                "--team" => cli.teams.push(value()?),
                "--node-name" => cli.node_names.push(value()?),
                "--help" | "-h" => cli.help = true,
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(cli)
    }
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Loads an `ArenaConfig` from a JSON file. Missing fields take their
/// defaults.
pub fn load(path: &Path) -> Result<ArenaConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid config JSON: {e}"))
}

/// Builds the process configuration: file (or defaults), then CLI
/// overrides, then the join address env fallback. The result is
/// validated.
pub fn resolve(cli: &CliArgs) -> Result<ArenaConfig, String> {
    let mut config = match &cli.config_path {
        Some(path) => load(path)?,
        None => ArenaConfig {
            log_dir: Some(default_log_dir()),
            ..ArenaConfig::default()
        },
    };

    merge_cli(&mut config, cli)?;

    if config.join_addrs.is_empty() {
        if let Ok(raw) = std::env::var(JOIN_ADDRS_ENV) {
            config.join_addrs = split_addrs(&raw);
        }
    }
    if config.node_name.is_empty() {
        config.node_name = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string());
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Layers CLI flags onto `config`. Flags only ever switch roles on;
/// list flags replace the configured list.
pub fn merge_cli(config: &mut ArenaConfig, cli: &CliArgs) -> Result<(), String> {
    if let Some(name) = &cli.name {
        config.node_name = name.clone();
    }
    config.enable_controller |= cli.controller;
    config.enable_node |= cli.node;
    if cli.simulation {
        config.enable_controller = true;
        config.enable_simulation = true;
    }
    if !cli.join_addrs.is_empty() {
        config.join_addrs = cli.join_addrs.clone();
    }
    if !cli.sensors.is_empty() {
        config.sensors = cli
            .sensors
            .iter()
            .map(|flag| SensorConfig::parse_flag(flag))
            .collect::<arena_types::Result<_>>()
            .map_err(|e| e.to_string())?;
        config.enable_sensors = true;
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = Some(dir.clone());
    }
    if !cli.teams.is_empty() {
        config.teams = cli.teams.clone();
    }
    if !cli.node_names.is_empty() {
        config.nodes = cli.node_names.clone();
    }
    Ok(())
}

/// Names of the nodes this process hosts.
///
/// With the controller in the same process every configured node runs
/// locally; otherwise the process is the single node `node_name`.
pub fn hosted_nodes(config: &ArenaConfig) -> Vec<String> {
    if !config.enable_node {
        return Vec::new();
    }
    if config.enable_controller {
        if config.nodes.is_empty() {
            return vec![format!("{}-node", config.node_name)];
        }
        return config
            .nodes
            .iter()
            .filter(|n| **n != config.node_name)
            .cloned()
            .collect();
    }
    vec![config.node_name.clone()]
}

fn split_addrs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Platform-specific default directory for end-of-game logs.
fn default_log_dir() -> PathBuf {
    match dirs::data_dir() {
        Some(data) => data.join("arena").join("logs"),
        None => PathBuf::from("arena-logs"),
    }
}

fn print_help() {
    println!(
        r#"Arena daemon - game controller and/or sensor node

USAGE:
    arena-daemon [OPTIONS]

OPTIONS:
    --config <PATH>        Load settings from a JSON config file
    --name <NAME>          Cluster member name (default: $HOSTNAME)
    --controller           Run the game controller
    --node                 Run a node
    --simulation           Run the controller and start a simulation game
    --join <ADDR>          Cluster member to join (repeatable)
    --sensor <SENSOR>      Sensor <id>:<device>:<gpiochip>:<hit>:<led>[:<count>]
                           or a test sensor id like test1 (repeatable)
    --logdir <PATH>        Directory for end-of-game logs
    --team <NAME>          Team name, in roster order (repeatable)
    --node-name <NAME>     Expected node name (repeatable)
    -h, --help             Show this help

EXAMPLES:
    # Controller plus three local nodes playing a simulation
    arena-daemon --name ctrl --node --simulation \
        --node-name alpha --node-name beta --node-name gamma

    # Use config file
    arena-daemon --config /etc/arena/daemon.json

ENVIRONMENT:
    ARENA_JOIN_ADDRS       Comma-separated join addresses (fallback)
    RUST_LOG               Log level filter (default: info)
"#
    );
}
