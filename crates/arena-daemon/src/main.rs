//! Arena daemon: headless controller and/or node process.
//!
//! Usage:
//!
//!   arena-daemon [OPTIONS]
//!
//! See `--help` for the flags. Every component in the process shares
//! one in-process cluster mesh; the controller is the seed member and
//! local nodes join it.
//!
//! The daemon runs until interrupted with Ctrl+C or until a component
//! fails.

use std::sync::Arc;

use arena_cluster::{supervise, MemoryCluster, ShutdownSignal, ShutdownTrigger};
use arena_game::Controller;
use arena_node::Node;
use arena_types::config::ArenaConfig;
use arena_types::protocol::MODE_SIMULATION;
use arena_types::{ArenaError, Result};
use tokio::task::{JoinHandle, JoinSet};

mod config;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = config::CliArgs::parse_from_env();
    let arena = match config::resolve(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    match run_daemon(arena).await {
        Ok(()) | Err(ArenaError::Cancelled) => tracing::info!("daemon stopped"),
        Err(e) => {
            tracing::error!("daemon error: {e}");
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon main logic
// ---------------------------------------------------------------------------

async fn run_daemon(cfg: ArenaConfig) -> Result<()> {
    if !cfg.enable_controller && !cfg.enable_node {
        return Err(ArenaError::ConfigError {
            reason: "nothing to run; enable the controller, a node or both".into(),
        });
    }

    let cluster = MemoryCluster::new();
    let trigger = ShutdownTrigger::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Controller, kept alive until the end so its engine handle stays open.
    let mut controller = None;
    if cfg.enable_controller {
        let uplink = cluster.uplink(&cfg.node_name, cfg.controller_tags.clone())?;
        let mut ctrl = Controller::new(&cfg, Arc::new(uplink))?;
        tasks.spawn(flatten(ctrl.start(&trigger.signal())?));
        tracing::info!(
            member = %cfg.node_name,
            teams = ?cfg.teams,
            nodes = ?cfg.nodes,
            "controller started"
        );
        controller = Some(ctrl);
    }

    // Nodes.
    for name in config::hosted_nodes(&cfg) {
        let join_addrs = if cfg.enable_controller {
            vec![cfg.node_name.clone()]
        } else {
            cfg.join_addrs.clone()
        };
        let node_cfg = ArenaConfig {
            node_name: name.clone(),
            join_addrs,
            ..cfg.clone()
        };
        let uplink = cluster.uplink(&name, node_cfg.node_tags.clone())?;
        let mut node = Node::new(&node_cfg, Arc::new(uplink))?;
        tasks.spawn(flatten(node.start(&trigger.signal())?));
        tracing::info!(node = %name, sensors = node.sensors().len(), "node started");
    }

    // Simulation.
    if let (true, Some(ctrl)) = (cfg.enable_simulation, &controller) {
        let engine = ctrl.engine().clone();
        tokio::spawn(async move {
            let started = match engine.new_game(MODE_SIMULATION).await {
                Ok(()) => engine.start_game().await,
                Err(e) => Err(e),
            };
            match started {
                Ok(()) => tracing::info!("simulation game started"),
                Err(ArenaError::Cancelled) => {}
                Err(e) => tracing::error!(%e, "cannot start simulation game"),
            }
        });
    }

    tasks.spawn(wait_for_interrupt(trigger.signal()));

    println!();
    println!("============================================================");
    println!("  Arena daemon running");
    println!("============================================================");
    println!("  Member:       {}", cfg.node_name);
    println!(
        "  Controller:   {}",
        if cfg.enable_controller { "enabled" } else { "disabled" }
    );
    println!("  Nodes:        {}", config::hosted_nodes(&cfg).join(", "));
    println!(
        "  Log dir:      {}",
        cfg.log_dir
            .as_ref()
            .map_or_else(|| "disabled".to_string(), |d| d.display().to_string())
    );
    println!("============================================================");
    println!("  Press Ctrl+C to stop");
    println!("============================================================");
    println!();

    let result = supervise(&mut tasks, &trigger).await;
    drop(controller);
    result
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolves with `Err(Cancelled)` on Ctrl+C or once the group stops.
async fn wait_for_interrupt(shutdown: ShutdownSignal) -> Result<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("received Ctrl+C, shutting down..."),
            Err(e) => tracing::warn!(%e, "cannot listen for Ctrl+C, shutting down"),
        },
        _ = shutdown.wait() => {}
    }
    Err(ArenaError::Cancelled)
}

async fn flatten(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.await.map_err(|e| ArenaError::ClusterError {
        reason: format!("component task aborted: {e}"),
    })?
}
