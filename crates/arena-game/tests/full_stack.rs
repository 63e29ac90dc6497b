//! Integration test: controller and real nodes on one in-memory mesh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arena_cluster::{MemoryCluster, ShutdownTrigger};
use arena_game::{Controller, EngineStage};
use arena_node::{Node, NodeState};
use arena_types::config::{ArenaConfig, SensorConfig};
use arena_types::protocol::{RANDOM_SENSOR_COLOR, RANDOM_SENSOR_HIT, RANDOM_TEAM_HIT};
use arena_types::{ArenaError, GameStatus};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn base() -> ArenaConfig {
    ArenaConfig {
        teams: names(&["red", "blue", "green"]),
        nodes: names(&["alpha", "beta", "gamma"]),
        colors: names(&["red", "blue", "green"]),
        winning_score: 1_000,
        ready_poll_ms: 1_000,
        mode_retry_ms: 500,
        join_retry_ms: 100,
        channel_capacity: 32,
        log_dir: None,
        ..ArenaConfig::default()
    }
}

fn node_config(name: &str) -> ArenaConfig {
    ArenaConfig {
        node_name: name.into(),
        enable_node: true,
        enable_sensors: true,
        enable_team_colors: true,
        join_addrs: vec!["ctrl".into()],
        sensors: vec![SensorConfig::test("test1"), SensorConfig::test("test2")],
        ..base()
    }
}

#[tokio::test(start_paused = true)]
async fn simulated_game_scores_add_up() -> TestResult {
    let cluster = MemoryCluster::new();
    let trigger = ShutdownTrigger::new();

    let cfg = ArenaConfig {
        node_name: "ctrl".into(),
        enable_controller: true,
        ..base()
    };
    let mut ctrl = Controller::new(&cfg, Arc::new(cluster.uplink("ctrl", cfg.controller_tags.clone())?))?;
    let ctrl_handle = ctrl.start(&trigger.signal())?;

    let mut nodes: Vec<Arc<NodeState>> = Vec::new();
    let mut node_handles = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let node_cfg = node_config(name);
        let mut node = Node::new(&node_cfg, Arc::new(cluster.uplink(name, node_cfg.node_tags.clone())?))?;
        nodes.push(Arc::clone(node.state()));
        node_handles.push(node.start(&trigger.signal())?);
    }

    ctrl.play("simulation").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &nodes {
        assert_eq!(node.status(), GameStatus::Running);
        assert_eq!(node.mode(), "simulation");
        assert_eq!(node.teams(), names(&["red", "blue", "green"]));
    }

    // Three simulated team hits, plus operator test actions.
    tokio::time::sleep(Duration::from_secs(10)).await;
    ctrl.action(RANDOM_TEAM_HIT, b"").await?;
    ctrl.action(RANDOM_SENSOR_COLOR, b"").await?;
    ctrl.action(RANDOM_SENSOR_HIT, b"").await?;
    ctrl.action(RANDOM_SENSOR_HIT, b"").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    ctrl.engine().end_game().await?;
    let status = ctrl.engine().status().await?;
    assert_eq!(status.stage, EngineStage::Ended);

    let team_total: u64 = status.game.scoreboard.values().sum();
    let node_total: u64 = status.game.nodeboard.values().sum();
    assert!(team_total >= 6, "scoreboard {:?}", status.game.scoreboard);
    assert_eq!(team_total, node_total);
    assert!(status
        .game
        .nodeboard
        .keys()
        .all(|n| ["alpha", "beta", "gamma"].contains(&n.as_str())));

    let winner = status.game.winner.clone();
    assert!(winner.is_some());
    assert_eq!(
        status.game.scoreboard.get(winner.as_deref().unwrap_or_default()),
        Some(&status.game.highscore)
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut hits_seen = BTreeMap::new();
    for node in &nodes {
        assert_eq!(node.status(), GameStatus::Ended);
        assert_eq!(node.winner(), winner);
        hits_seen.insert(node.name().to_string(), node.hits().get(node.name()).copied().unwrap_or(0));
    }
    assert_eq!(hits_seen, status.game.nodeboard);

    trigger.trigger();
    assert!(matches!(ctrl_handle.await?, Err(ArenaError::Cancelled)));
    for handle in node_handles {
        assert!(matches!(handle.await?, Err(ArenaError::Cancelled)));
    }
    Ok(())
}
