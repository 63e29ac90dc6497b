//! In-process event bus and query protocol.
//!
//! Four bounded queues connect the game, the engine and the cluster
//! uplink:
//!
//! | queue     | direction          | full queue                      |
//! |-----------|--------------------|---------------------------------|
//! | `request` | game → engine      | producer waits (or `try_` drops) |
//! | `game`    | engine → game      | producer waits (or `try_` drops) |
//! | `cluster` | engine → network   | producer waits                  |
//! | `query`   | engine → network   | producer waits                  |
//!
//! A query carries a single-use response slot. The asker blocks on the
//! slot; whoever owns the uplink performs the fan-out and fills the
//! slot exactly once, errors included.

use std::collections::{BTreeMap, HashMap};

use arena_types::{ArenaError, GameEvent, Result};
use tokio::sync::{mpsc, oneshot};

/// Default capacity of every bus queue.
pub const DEFAULT_BUS_CAPACITY: usize = 10;

// ---------------------------------------------------------------------------
// GameQuery
// ---------------------------------------------------------------------------

/// Answers collected for one query.
#[derive(Debug, Default)]
pub struct GameQueryResponse {
    /// Answer payload per responding member.
    pub answers: HashMap<String, Vec<u8>>,
    /// Transport failure, if the fan-out could not be performed.
    pub error: Option<ArenaError>,
}

impl GameQueryResponse {
    /// A successful response.
    pub fn ok(answers: HashMap<String, Vec<u8>>) -> Self {
        Self {
            answers,
            error: None,
        }
    }

    /// A failed response.
    pub fn failed(error: ArenaError) -> Self {
        Self {
            answers: HashMap::new(),
            error: Some(error),
        }
    }

    /// Converts into a `Result`, surfacing the transport error.
    pub fn into_result(self) -> Result<HashMap<String, Vec<u8>>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.answers),
        }
    }
}

/// A fan-out query travelling from the engine to the uplink owner.
pub struct GameQuery {
    /// Query name, e.g. `node:ready`.
    pub name: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Only members carrying all of these tags are asked.
    pub tags: BTreeMap<String, String>,
    response: oneshot::Sender<GameQueryResponse>,
}

impl GameQuery {
    /// Creates a query and the slot its response will arrive on.
    pub fn new(
        name: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        tags: BTreeMap<String, String>,
    ) -> (Self, oneshot::Receiver<GameQueryResponse>) {
        let (response, rx) = oneshot::channel();
        let query = Self {
            name: name.into(),
            payload: payload.into(),
            tags,
            response,
        };
        (query, rx)
    }

    /// Fills the response slot. Consumes the query, so the slot is
    /// written at most once. A vanished asker is only logged.
    pub fn respond(self, response: GameQueryResponse) {
        if self.response.send(response).is_err() {
            tracing::debug!(query = %self.name, "query asker went away before the response");
        }
    }
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for GameQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameQuery")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Sending side of the bus. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventBus {
    request_tx: mpsc::Sender<GameEvent>,
    game_tx: mpsc::Sender<GameEvent>,
    cluster_tx: mpsc::Sender<GameEvent>,
    query_tx: mpsc::Sender<GameQuery>,
}

/// Receiving side of the bus, handed out once to the owning consumers.
#[derive(Debug)]
pub struct BusReceivers {
    /// Consumed by the engine.
    pub request_rx: mpsc::Receiver<GameEvent>,
    /// Consumed by the running game.
    pub game_rx: mpsc::Receiver<GameEvent>,
    /// Consumed by the uplink pump.
    pub cluster_rx: mpsc::Receiver<GameEvent>,
    /// Consumed by the uplink pump.
    pub query_rx: mpsc::Receiver<GameQuery>,
}

/// Creates the four bus queues with the given capacity each.
pub fn event_bus(capacity: usize) -> (EventBus, BusReceivers) {
    let capacity = capacity.max(1);
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (game_tx, game_rx) = mpsc::channel(capacity);
    let (cluster_tx, cluster_rx) = mpsc::channel(capacity);
    let (query_tx, query_rx) = mpsc::channel(capacity);

    let bus = EventBus {
        request_tx,
        game_tx,
        cluster_tx,
        query_tx,
    };
    let receivers = BusReceivers {
        request_rx,
        game_rx,
        cluster_rx,
        query_rx,
    };
    (bus, receivers)
}

fn closed(queue: &str) -> ArenaError {
    ArenaError::ChannelClosed {
        reason: format!("{queue} queue closed"),
    }
}

impl EventBus {
    /// Enqueues an action intent for the engine, waiting for room.
    pub async fn request(&self, event: GameEvent) -> Result<()> {
        self.request_tx
            .send(event)
            .await
            .map_err(|_| closed("request"))
    }

    /// Enqueues an action intent without waiting. Dropped with a log
    /// line if the queue is full.
    pub fn try_request(&self, event: GameEvent) {
        try_enqueue(&self.request_tx, event, "request");
    }

    /// Sends a control signal to the running game, waiting for room.
    pub async fn send_to_game(&self, event: GameEvent) -> Result<()> {
        self.game_tx.send(event).await.map_err(|_| closed("game"))
    }

    /// Enqueues an outbound cluster broadcast.
    pub async fn send_to_nodes(&self, event: GameEvent) -> Result<()> {
        self.cluster_tx
            .send(event)
            .await
            .map_err(|_| closed("cluster"))
    }

    /// Runs a fan-out query and blocks until its response slot is filled.
    pub async fn query(
        &self,
        name: &str,
        payload: &[u8],
        tags: &BTreeMap<String, String>,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let (query, slot) = GameQuery::new(name, payload, tags.clone());
        self.query_tx.send(query).await.map_err(|_| closed("query"))?;
        let response = slot.await.map_err(|_| ArenaError::ChannelClosed {
            reason: format!("response slot for query '{name}' dropped"),
        })?;
        response.into_result()
    }
}

fn try_enqueue(tx: &mpsc::Sender<GameEvent>, event: GameEvent, queue: &str) {
    if let Err(e) = tx.try_send(event) {
        let reason = match &e {
            mpsc::error::TrySendError::Full(_) => "full",
            mpsc::error::TrySendError::Closed(_) => "closed",
        };
        tracing::warn!(queue, reason, event = %e.into_inner().name, "dropping event");
    }
}
