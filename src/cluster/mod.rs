//! Node lifecycle: identity, heartbeat cadence, and the directory-facing
//! `NodeManager`.

pub mod heartbeat;
pub mod manager;
pub mod node;

pub use heartbeat::HeartbeatConfig;
pub use manager::{
    ClusterInfo, ManagerError, NodeInfo, NodeManager, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TTL_SECS,
};
pub use node::{ConnectionCounter, Node, NodeHeartbeat, NodeSummary};
