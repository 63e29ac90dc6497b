//! Arena node runtime.
//!
//! A node hosts zero or more hit sensors, mirrors the controller's game
//! status and keeps its own hit ledger, which the controller collects
//! through the scoreboard query.
//!
//! - [`state`]: the local hit ledger.
//! - [`dispatcher`]: applies inbound cluster traffic and answers queries.
//! - [`sensor`] / [`debounce`]: sensor tasks and hit input debouncing.
//! - [`node`]: the task group tying them to a cluster uplink.

pub mod debounce;
pub mod dispatcher;
pub mod node;
pub mod sensor;
pub mod state;

pub use debounce::{edge_queue, EdgeSender, HitDebouncer};
pub use dispatcher::NodeDispatcher;
pub use node::Node;
pub use sensor::{Sensor, SensorCommand, SensorHandle};
pub use state::{NodeSnapshot, NodeState};
