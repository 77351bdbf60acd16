//! Node identity and the heartbeat payload published to the KVPS directory.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Heartbeat payload a node writes to `websocket:node:<nodeId>:heartbeat` on
/// every tick. Matches the data model's `{timestamp, uptime, connectionCount,
/// memoryUsage}` heartbeat shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub timestamp: DateTime<Utc>,
    pub uptime: u64,
    #[serde(rename = "connectionCount")]
    pub connection_count: u32,
    #[serde(rename = "memoryUsage")]
    pub memory_usage: u64,
}

/// This node's identity and start time. Cheap to clone; shared across the
/// manager, router and services.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

impl Node {
    /// `{hostname}-{pid}-{unix_millis_start}-{rand_u32:08x}`.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let pid = std::process::id();
        let started_at = Utc::now();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let rand: u32 = rand::thread_rng().gen();

        Self {
            id: format!("{hostname}-{pid}-{millis}-{rand:08x}"),
            hostname,
            started_at,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

/// Local connection counter shared between the registry and the heartbeat
/// client, so heartbeats report the node's true local connection count
/// without locking the registry itself.
#[derive(Debug, Default)]
pub struct ConnectionCounter(AtomicU32);

impl ConnectionCounter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Summary returned by `getClusterInfo` for a single known node. `heartbeat`
/// is `None` when the node is in the active set but its heartbeat key has
/// expired or was never written — callers should treat that node as dead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub heartbeat: Option<NodeHeartbeat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_contains_hostname_and_pid() {
        let node = Node::new("gateway-1");
        assert!(node.id.starts_with("gateway-1-"));
        assert!(node.id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn two_nodes_get_distinct_ids() {
        let a = Node::new("h");
        let b = Node::new("h");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn connection_counter_tracks_in_out() {
        let c = ConnectionCounter::default();
        c.increment();
        c.increment();
        c.decrement();
        assert_eq!(c.get(), 1);
    }
}
