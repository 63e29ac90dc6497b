//! Cluster plumbing for the arena workspace.
//!
//! The gossip transport itself is an external collaborator; this crate
//! only defines the contract the game consumes ([`uplink::ClusterUplink`])
//! plus the pieces every process needs around it:
//!
//! - [`events`]: inbound broadcast events and queries handed to a handler.
//! - [`join`]: join-until-connected retry loop.
//! - [`shutdown`]: the top-down cancellation signal.
//! - [`memory`]: an in-process mesh used for single-host arenas and tests.

pub mod events;
pub mod join;
pub mod memory;
pub mod shutdown;
pub mod uplink;

pub use events::{ClusterEvent, ClusterQuery};
pub use join::join_with_retry;
pub use memory::{MemoryCluster, MemoryUplink};
pub use shutdown::{supervise, ShutdownSignal, ShutdownTrigger};
pub use uplink::{ClusterUplink, QueryParams};
