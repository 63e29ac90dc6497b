//! Integration test: controller and engine against scripted nodes.
//!
//! Every node here is a bare handler on the in-memory mesh that answers
//! the readiness, mode and scoreboard queries, so the engine's lifecycle
//! can be driven without the real node runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_cluster::{ClusterEvent, ClusterUplink, MemoryCluster, ShutdownTrigger};
use arena_game::save::list_game_logs;
use arena_game::scoreboard::aggregate_scoreboard;
use arena_game::{Controller, EngineStage};
use arena_types::config::ArenaConfig;
use arena_types::protocol::{
    GAME_BEGIN, GAME_END, GAME_ERROR, GAME_MODE, GAME_TEAMS, GAME_WINNER, NODE_READY,
    NODE_SCOREBOARD, UI_GAME_MODE,
};
use arena_types::{ArenaError, GameStatus};
use tokio::sync::mpsc;
use tokio::time::Instant;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

type EventLog = Arc<Mutex<Vec<String>>>;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn role(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("role".to_string(), value.to_string())])
}

fn config(nodes: &[&str]) -> ArenaConfig {
    ArenaConfig {
        node_name: "ctrl".into(),
        teams: names(&["red", "blue", "green"]),
        nodes: names(nodes),
        winning_score: 100,
        ready_poll_ms: 1_000,
        mode_retry_ms: 500,
        log_dir: None,
        ..ArenaConfig::default()
    }
}

/// Scripted node behavior.
struct Script {
    name: &'static str,
    tags: BTreeMap<String, String>,
    join_after: Duration,
    /// Ignore the first mode-set broadcast.
    skip_first_mode: bool,
    hits: &'static str,
}

impl Script {
    fn node(name: &'static str, hits: &'static str) -> Self {
        Self {
            name,
            tags: role("node"),
            join_after: Duration::ZERO,
            skip_first_mode: false,
            hits,
        }
    }
}

/// Registers `script` on the mesh and returns the names of the user
/// events it receives.
fn spawn_node(cluster: &MemoryCluster, script: Script) -> arena_types::Result<EventLog> {
    let uplink = cluster.uplink(script.name, script.tags.clone())?;
    let (tx, mut rx) = mpsc::channel(64);
    uplink.register_handler(tx)?;

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    tokio::spawn(async move {
        tokio::time::sleep(script.join_after).await;
        if uplink.join(&["ctrl".to_string()]).await.is_err() {
            return;
        }

        let mut mode = String::new();
        let mut skipped = !script.skip_first_mode;
        while let Some(event) = rx.recv().await {
            match event {
                ClusterEvent::User { name, payload } => {
                    if name == GAME_MODE {
                        if skipped {
                            mode = String::from_utf8_lossy(&payload).into_owned();
                        }
                        skipped = true;
                    }
                    if let Ok(mut seen) = seen.lock() {
                        seen.push(name);
                    }
                }
                ClusterEvent::Query(query) => {
                    let answer = match query.name.as_str() {
                        NODE_READY => "true".to_string(),
                        GAME_MODE => mode.clone(),
                        NODE_SCOREBOARD => script.hits.to_string(),
                        _ => continue,
                    };
                    let _ = query.respond(answer);
                }
            }
        }
    });
    Ok(log)
}

fn count(log: &EventLog, name: &str) -> usize {
    log.lock().map(|l| l.iter().filter(|n| *n == name).count()).unwrap_or(0)
}

/// Waits (in paused time) until `log` has seen `name`.
async fn wait_for(log: &EventLog, name: &str) -> TestResult {
    for _ in 0..100 {
        if count(log, name) > 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(format!("event '{name}' never arrived").into())
}

async fn stop(trigger: ShutdownTrigger, handle: tokio::task::JoinHandle<arena_types::Result<()>>) -> TestResult {
    trigger.trigger();
    let result = handle.await?;
    assert!(matches!(result, Err(ArenaError::Cancelled)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_waits_for_ready_nodes_and_unanimous_mode() -> TestResult {
    let cluster = MemoryCluster::new();
    let cfg = config(&["alpha", "beta", "gamma"]);
    let uplink = cluster.uplink("ctrl", cfg.controller_tags.clone())?;
    let mut ctrl = Controller::new(&cfg, Arc::new(uplink))?;
    let trigger = ShutdownTrigger::new();
    let handle = ctrl.start(&trigger.signal())?;

    let alpha = spawn_node(&cluster, Script::node("alpha", r#"{"alpha":12,"red":12}"#))?;
    spawn_node(
        &cluster,
        Script {
            join_after: Duration::from_secs(15),
            ..Script::node("beta", r#"{"beta":9,"blue":9}"#)
        },
    )?;
    let gamma = spawn_node(
        &cluster,
        Script {
            join_after: Duration::from_secs(25),
            skip_first_mode: true,
            ..Script::node("gamma", r#"{"gamma":3,"green":3,"s1":3}"#)
        },
    )?;

    let started = Instant::now();
    ctrl.play("simulation").await?;
    assert!(started.elapsed() >= Duration::from_secs(25));

    let status = ctrl.engine().status().await?;
    assert_eq!(status.stage, EngineStage::Running);
    assert_eq!(status.mode.as_deref(), Some("simulation"));
    assert_eq!(status.game.status, GameStatus::Running);
    assert_eq!(status.game.game_duration_secs, 180);
    assert_eq!(status.game.nodes, names(&["alpha", "beta", "gamma"]));

    // gamma ignored the first mode-set, so the step was retried.
    assert!(count(&gamma, GAME_MODE) >= 2);
    wait_for(&alpha, GAME_TEAMS).await?;
    wait_for(&alpha, GAME_BEGIN).await?;

    assert!(matches!(
        ctrl.action(UI_GAME_MODE, b"simulation").await,
        Err(ArenaError::GameRunning)
    ));

    stop(trigger, handle).await
}

#[tokio::test(start_paused = true)]
async fn end_game_announces_strict_winner() -> TestResult {
    let cluster = MemoryCluster::new();
    let cfg = config(&["alpha", "beta", "gamma"]);
    let uplink = cluster.uplink("ctrl", cfg.controller_tags.clone())?;
    let mut ctrl = Controller::new(&cfg, Arc::new(uplink))?;
    let trigger = ShutdownTrigger::new();
    let handle = ctrl.start(&trigger.signal())?;

    let alpha = spawn_node(&cluster, Script::node("alpha", r#"{"alpha":12,"red":12}"#))?;
    spawn_node(&cluster, Script::node("beta", r#"{"beta":9,"blue":9}"#))?;
    spawn_node(&cluster, Script::node("gamma", r#"{"gamma":3,"green":3,"s1":3}"#))?;

    ctrl.play("simulation").await?;
    ctrl.engine().end_game().await?;

    let status = ctrl.engine().status().await?;
    assert_eq!(status.stage, EngineStage::Ended);
    assert_eq!(status.game.winner.as_deref(), Some("red"));
    assert_eq!(status.game.highscore, 12);
    assert_eq!(
        status.game.scoreboard,
        BTreeMap::from([
            ("red".to_string(), 12),
            ("blue".to_string(), 9),
            ("green".to_string(), 3),
        ])
    );
    assert_eq!(status.game.nodeboard.get("gamma"), Some(&3));
    assert!(!status.game.scoreboard.contains_key("s1"));

    wait_for(&alpha, GAME_END).await?;
    wait_for(&alpha, GAME_WINNER).await?;

    // A finished game may be replaced.
    ctrl.engine().new_game("simulation").await?;
    assert_eq!(ctrl.engine().status().await?.stage, EngineStage::Mounted);

    stop(trigger, handle).await
}

#[tokio::test(start_paused = true)]
async fn roster_violation_fails_game_and_resets() -> TestResult {
    let dir = std::env::temp_dir().join(format!(
        "arena_engine_flow_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    ));

    let cluster = MemoryCluster::new();
    let cfg = ArenaConfig {
        log_dir: Some(dir.clone()),
        ..config(&["alpha", "beta"])
    };
    let uplink = cluster.uplink("ctrl", cfg.controller_tags.clone())?;
    let mut ctrl = Controller::new(&cfg, Arc::new(uplink))?;
    let trigger = ShutdownTrigger::new();
    let handle = ctrl.start(&trigger.signal())?;

    spawn_node(&cluster, Script::node("alpha", "{}"))?;
    spawn_node(&cluster, Script::node("beta", "{}"))?;

    // Two nodes against a minimum of three: not an error for the caller.
    ctrl.play("simulation").await?;
    assert_eq!(ctrl.engine().status().await?.stage, EngineStage::Idle);

    let logs = list_game_logs(&dir)?;
    assert_eq!(logs.len(), 2);
    let failed = arena_game::save::read_game_log(&dir, &logs[1])?;
    assert_eq!(failed.status, GameStatus::Failed);
    assert_eq!(
        failed.timeline.last().map(|e| e.event.name.as_str()),
        Some(GAME_ERROR)
    );

    let _ = std::fs::remove_dir_all(&dir);
    stop(trigger, handle).await
}

#[tokio::test(start_paused = true)]
async fn scoreboard_query_only_counts_tagged_nodes() -> TestResult {
    let cluster = MemoryCluster::new();
    let cfg = config(&["alpha", "beta", "watcher"]);
    let uplink = cluster.uplink("ctrl", cfg.controller_tags.clone())?;
    let mut ctrl = Controller::new(&cfg, Arc::new(uplink))?;
    let trigger = ShutdownTrigger::new();
    let handle = ctrl.start(&trigger.signal())?;

    spawn_node(&cluster, Script::node("alpha", r#"{"alpha":4,"red":3,"blue":1,"s1":4}"#))?;
    spawn_node(&cluster, Script::node("beta", r#"{"beta":2,"red":2,"mystery":7}"#))?;
    spawn_node(
        &cluster,
        Script {
            tags: role("observer"),
            ..Script::node("watcher", r#"{"watcher":50,"red":50}"#)
        },
    )?;
    // Let the scripted members join.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let answers = ctrl
        .bus()
        .query(NODE_SCOREBOARD, b"", &cfg.node_tags)
        .await?;
    assert_eq!(answers.len(), 2);

    let (scoreboard, nodeboard) =
        aggregate_scoreboard(&answers, &cfg.teams, &cfg.nodes);
    assert_eq!(
        scoreboard,
        BTreeMap::from([("red".to_string(), 5), ("blue".to_string(), 1)])
    );
    assert_eq!(
        nodeboard,
        BTreeMap::from([("alpha".to_string(), 4), ("beta".to_string(), 2)])
    );

    stop(trigger, handle).await
}
