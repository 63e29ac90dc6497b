//! Aggregation of per-node hit maps into team and node totals.
//!
//! Each node answers the scoreboard query with its local hit map, keyed
//! by its own name, its sensor ids and the team colors it was hit with.
//! Keys naming a configured team count toward the scoreboard, keys
//! naming a configured node count toward the nodeboard, and everything
//! else (sensor ids, unknown names) is logged and ignored.

use std::collections::{BTreeMap, HashMap};

use arena_types::protocol::parse_hit_map;

/// Team-keyed and node-keyed totals.
pub type Boards = (BTreeMap<String, u64>, BTreeMap<String, u64>);

/// Folds the scoreboard query answers into `(scoreboard, nodeboard)`.
///
/// An answer that is not a valid hit map is skipped with a warning.
/// Totals saturate at `u64::MAX`.
pub fn aggregate_scoreboard(
    answers: &HashMap<String, Vec<u8>>,
    teams: &[String],
    nodes: &[String],
) -> Boards {
    let mut scoreboard = BTreeMap::new();
    let mut nodeboard = BTreeMap::new();

    for (node, payload) in answers {
        let hits = match parse_hit_map(payload) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(%node, %e, "skipping node scoreboard");
                continue;
            }
        };

        for (key, count) in hits {
            let is_team = teams.contains(&key);
            let is_node = nodes.contains(&key);

            if is_team {
                let total = scoreboard.entry(key.clone()).or_insert(0u64);
                *total = total.saturating_add(count);
            }
            if is_node {
                let total = nodeboard.entry(key.clone()).or_insert(0u64);
                *total = total.saturating_add(count);
            }
            if !is_team && !is_node {
                tracing::debug!(%node, %key, "unrecognized team or node in scoreboard");
            }
        }
    }

    (scoreboard, nodeboard)
}
