//! In-process cluster mesh.
//!
//! [`MemoryCluster`] stands in for the gossip transport when every
//! member lives in one process: the single-host daemon and the
//! integration tests. Addresses are member names. Members that have
//! joined (or been joined) form one group; broadcasts and queries from
//! a group member reach every group member including the sender, while
//! a member outside the group only reaches itself.
//!
//! Delivery into a member's handler queue is `try_send`: a full queue
//! drops the event with a warning, like a lossy network would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use arena_types::{ArenaError, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

use crate::events::{ClusterEvent, ClusterQuery};
use crate::uplink::{ClusterUplink, QueryParams};

// ---------------------------------------------------------------------------
// Mesh state
// ---------------------------------------------------------------------------

struct Member {
    tags: BTreeMap<String, String>,
    handler: Option<mpsc::Sender<ClusterEvent>>,
    in_group: bool,
    alive: bool,
}

#[derive(Default)]
struct Mesh {
    members: BTreeMap<String, Member>,
}

impl Mesh {
    /// Handlers of every member `from` can currently reach, with tags.
    fn reachable(
        &self,
        from: &str,
    ) -> Result<Vec<(String, BTreeMap<String, String>, Option<mpsc::Sender<ClusterEvent>>)>> {
        let me = self.live_member(from)?;
        let targets = self
            .members
            .iter()
            .filter(|(name, m)| {
                m.alive && (name.as_str() == from || (me.in_group && m.in_group))
            })
            .map(|(name, m)| (name.clone(), m.tags.clone(), m.handler.clone()))
            .collect();
        Ok(targets)
    }

    fn live_member(&self, name: &str) -> Result<&Member> {
        match self.members.get(name) {
            Some(m) if m.alive => Ok(m),
            _ => Err(ArenaError::ClusterError {
                reason: format!("member '{name}' is not part of the mesh"),
            }),
        }
    }

    fn live_member_mut(&mut self, name: &str) -> Result<&mut Member> {
        match self.members.get_mut(name) {
            Some(m) if m.alive => Ok(m),
            _ => Err(ArenaError::ClusterError {
                reason: format!("member '{name}' is not part of the mesh"),
            }),
        }
    }
}

fn lock(mesh: &Mutex<Mesh>) -> Result<MutexGuard<'_, Mesh>> {
    mesh.lock().map_err(|_| ArenaError::ClusterError {
        reason: "mesh lock poisoned".into(),
    })
}

// ---------------------------------------------------------------------------
// MemoryCluster
// ---------------------------------------------------------------------------

/// Shared in-process mesh. Clone to hand out to several owners.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    mesh: Arc<Mutex<Mesh>>,
}

impl MemoryCluster {
    /// Creates an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member and returns its uplink.
    ///
    /// The member starts outside the group until it joins or is joined.
    /// Fails if a live member already uses `name`.
    pub fn uplink(
        &self,
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Result<MemoryUplink> {
        let name = name.into();
        let mut mesh = lock(&self.mesh)?;
        if mesh.members.get(&name).is_some_and(|m| m.alive) {
            return Err(ArenaError::ClusterError {
                reason: format!("member name '{name}' already in use"),
            });
        }
        mesh.members.insert(
            name.clone(),
            Member {
                tags,
                handler: None,
                in_group: false,
                alive: true,
            },
        );
        Ok(MemoryUplink {
            name,
            mesh: Arc::clone(&self.mesh),
        })
    }

    /// Names of live members currently in the group.
    pub fn members(&self) -> Result<Vec<String>> {
        let mesh = lock(&self.mesh)?;
        Ok(mesh
            .members
            .iter()
            .filter(|(_, m)| m.alive && m.in_group)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryUplink
// ---------------------------------------------------------------------------

/// One member's view of a [`MemoryCluster`].
pub struct MemoryUplink {
    name: String,
    mesh: Arc<Mutex<Mesh>>,
}

#[async_trait]
impl ClusterUplink for MemoryUplink {
    fn local_name(&self) -> &str {
        &self.name
    }

    async fn join(&self, addrs: &[String]) -> Result<usize> {
        let mut mesh = lock(&self.mesh)?;
        mesh.live_member(&self.name)?;

        let mut joined = 0;
        for addr in addrs {
            if addr == &self.name {
                continue;
            }
            if let Some(target) = mesh.members.get_mut(addr) {
                if target.alive {
                    target.in_group = true;
                    joined += 1;
                }
            }
        }
        if joined > 0 {
            mesh.live_member_mut(&self.name)?.in_group = true;
        }

        tracing::debug!(member = %self.name, joined, "mesh join");
        Ok(joined)
    }

    async fn broadcast(&self, name: &str, payload: &[u8], coalesce: bool) -> Result<()> {
        let targets = lock(&self.mesh)?.reachable(&self.name)?;
        tracing::trace!(member = %self.name, event = %name, coalesce, "mesh broadcast");

        for (member, _, handler) in targets {
            let Some(handler) = handler else { continue };
            let event = ClusterEvent::User {
                name: name.to_string(),
                payload: payload.to_vec(),
            };
            if let Err(e) = handler.try_send(event) {
                tracing::warn!(%member, event = %name, %e, "dropping broadcast");
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        payload: &[u8],
        params: &QueryParams,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let targets = lock(&self.mesh)?.reachable(&self.name)?;
        let deadline = Instant::now() + params.timeout;

        let mut pending: Vec<(String, oneshot::Receiver<Vec<u8>>)> = Vec::new();
        for (member, tags, handler) in targets {
            if !params.matches(&tags) {
                continue;
            }
            let Some(handler) = handler else { continue };
            let (query, rx) = ClusterQuery::new(name, payload);
            match handler.try_send(ClusterEvent::Query(query)) {
                Ok(()) => pending.push((member, rx)),
                Err(e) => tracing::warn!(%member, query = %name, %e, "dropping query"),
            }
        }

        let mut answers = HashMap::with_capacity(pending.len());
        for (member, rx) in pending {
            match timeout_at(deadline, rx).await {
                Ok(Ok(answer)) => {
                    answers.insert(member, answer);
                }
                Ok(Err(_)) => tracing::debug!(%member, query = %name, "member declined to answer"),
                Err(_) => tracing::debug!(%member, query = %name, "query timed out"),
            }
        }
        Ok(answers)
    }

    fn register_handler(&self, handler: mpsc::Sender<ClusterEvent>) -> Result<()> {
        let mut mesh = lock(&self.mesh)?;
        mesh.live_member_mut(&self.name)?.handler = Some(handler);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let mut mesh = lock(&self.mesh)?;
        if let Some(member) = mesh.members.get_mut(&self.name) {
            member.in_group = false;
        }
        tracing::debug!(member = %self.name, "left mesh");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut mesh = lock(&self.mesh)?;
        if let Some(member) = mesh.members.get_mut(&self.name) {
            member.in_group = false;
            member.alive = false;
            member.handler = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_live_name_rejected() -> Result<()> {
        let cluster = MemoryCluster::new();
        let first = cluster.uplink("alpha", BTreeMap::new())?;
        assert!(cluster.uplink("alpha", BTreeMap::new()).is_err());

        first.shutdown().await?;
        assert!(cluster.uplink("alpha", BTreeMap::new()).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn join_counts_reachable_members() -> Result<()> {
        let cluster = MemoryCluster::new();
        let _seed = cluster.uplink("seed", BTreeMap::new())?;
        let node = cluster.uplink("node", BTreeMap::new())?;

        assert_eq!(node.join(&["missing".to_string()]).await?, 0);
        assert!(cluster.members()?.is_empty());

        assert_eq!(node.join(&["seed".to_string(), "node".to_string()]).await?, 1);
        assert_eq!(cluster.members()?, vec!["node".to_string(), "seed".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn outsider_only_hears_itself() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let cluster = MemoryCluster::new();
        let lonely = cluster.uplink("lonely", BTreeMap::new())?;
        let other = cluster.uplink("other", BTreeMap::new())?;

        let (tx_lonely, mut rx_lonely) = mpsc::channel(4);
        let (tx_other, mut rx_other) = mpsc::channel(4);
        lonely.register_handler(tx_lonely)?;
        other.register_handler(tx_other)?;

        lonely.broadcast("game:begin", b"", false).await?;
        assert!(matches!(rx_lonely.try_recv(), Ok(ClusterEvent::User { .. })));
        assert!(rx_other.try_recv().is_err());
        Ok(())
    }
}
