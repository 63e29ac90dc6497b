//! Inbound cluster traffic delivered to a registered handler.
//!
//! The transport pushes every user broadcast and every query it receives
//! into the handler's bounded queue as a [`ClusterEvent`]. Queries carry
//! a single-use responder; dropping it without answering means "no
//! reply from this member".

use arena_types::{ArenaError, Result};
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// ClusterEvent
// ---------------------------------------------------------------------------

/// One inbound message from the cluster.
#[derive(Debug)]
pub enum ClusterEvent {
    /// A user broadcast.
    User {
        /// Event name.
        name: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// A fan-out query awaiting this member's answer.
    Query(ClusterQuery),
}

// ---------------------------------------------------------------------------
// ClusterQuery
// ---------------------------------------------------------------------------

/// A query addressed to this member.
pub struct ClusterQuery {
    /// Query name.
    pub name: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    responder: oneshot::Sender<Vec<u8>>,
}

impl ClusterQuery {
    /// Creates a query and the receiver its answer will arrive on.
    pub fn new(
        name: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (responder, rx) = oneshot::channel();
        let query = Self {
            name: name.into(),
            payload: payload.into(),
            responder,
        };
        (query, rx)
    }

    /// Answers the query. Consumes it so a query is answered at most once.
    ///
    /// Fails with `ChannelClosed` if the asker already gave up (timeout).
    pub fn respond(self, answer: impl Into<Vec<u8>>) -> Result<()> {
        let name = self.name;
        self.responder
            .send(answer.into())
            .map_err(|_| ArenaError::ChannelClosed {
                reason: format!("query '{name}' no longer awaiting a response"),
            })
    }
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for ClusterQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterQuery")
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_delivers_once() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (query, rx) = ClusterQuery::new("node:ready", Vec::new());
        query.respond("true")?;
        assert_eq!(rx.await?, b"true".to_vec());
        Ok(())
    }

    #[test]
    fn respond_after_asker_left_is_an_error() {
        let (query, rx) = ClusterQuery::new("node:ready", Vec::new());
        drop(rx);
        assert!(matches!(
            query.respond("true"),
            Err(ArenaError::ChannelClosed { .. })
        ));
    }
}
