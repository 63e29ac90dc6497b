//! The cluster transport contract.
//!
//! Anything that can join a membership group, broadcast user events,
//! run a tag-filtered fan-out query and deliver inbound traffic to a
//! handler can carry an arena. The engine never talks to a transport
//! directly; the controller pumps the event bus into an uplink.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use arena_types::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::ClusterEvent;

/// Default fan-out query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// QueryParams
// ---------------------------------------------------------------------------

/// Parameters for one fan-out query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryParams {
    /// Only members carrying every listed tag with the same value are
    /// asked. Empty means everybody.
    pub filter_tags: BTreeMap<String, String>,
    /// How long to collect answers.
    pub timeout: Duration,
}

impl QueryParams {
    /// Query every member with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            filter_tags: BTreeMap::new(),
            timeout,
        }
    }

    /// Restricts the query to members matching `tags`.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.filter_tags = tags;
        self
    }

    /// Returns `true` if a member advertising `tags` passes the filter.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.filter_tags
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

impl Default for QueryParams {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

// ---------------------------------------------------------------------------
// ClusterUplink
// ---------------------------------------------------------------------------

/// Join/broadcast/query primitives over the gossip transport.
#[async_trait]
pub trait ClusterUplink: Send + Sync {
    /// Name this member is known by in the cluster.
    fn local_name(&self) -> &str;

    /// Contacts the given members. Returns how many were reached; the
    /// caller retries while this is zero.
    async fn join(&self, addrs: &[String]) -> Result<usize>;

    /// Sends a user event to every member. Delivery is best-effort and
    /// unordered across members.
    async fn broadcast(&self, name: &str, payload: &[u8], coalesce: bool) -> Result<()>;

    /// Asks every member matching the filter and collects the answers
    /// that arrive before the timeout, keyed by member name.
    async fn query(
        &self,
        name: &str,
        payload: &[u8],
        params: &QueryParams,
    ) -> Result<HashMap<String, Vec<u8>>>;

    /// Installs the queue inbound events and queries are pushed to.
    /// Replaces any previous handler.
    fn register_handler(&self, handler: mpsc::Sender<ClusterEvent>) -> Result<()>;

    /// Leaves the cluster gracefully.
    async fn leave(&self) -> Result<()>;

    /// Releases the transport. No further traffic is delivered.
    async fn shutdown(&self) -> Result<()>;
}
