//! Node Manager: node lifecycle, the client→node directory, and per-channel
//! node-affinity tracking on top of the KVPS adapter.
//!
//! Every key this module touches lives under the `websocket:` prefix, matching
//! the keyspace other nodes in the cluster read and write:
//! `websocket:nodes`, `websocket:node:<id>:info`, `websocket:node:<id>:heartbeat`,
//! `websocket:node:<id>:clients`, `websocket:node:<id>:channels`,
//! `websocket:client:<id>:node`, `websocket:client:<id>:channels`,
//! `websocket:client:<id>:metadata`, `websocket:channel:<name>:nodes`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::kvps::{Kvps, KvpsError};
use crate::metrics::SharedMetricsCollector;

use super::heartbeat::HeartbeatConfig;
use super::node::{ConnectionCounter, Node, NodeHeartbeat, NodeSummary};

/// How often a node republishes its heartbeat.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// TTL on the heartbeat key; 3x the interval tolerates a couple of missed
/// beats before a node is considered gone.
pub const HEARTBEAT_TTL_SECS: u64 = HEARTBEAT_INTERVAL_SECS * 3;

const ACTIVE_NODES_KEY: &str = "websocket:nodes";

fn node_info_key(node_id: &str) -> String {
    format!("websocket:node:{node_id}:info")
}

fn node_heartbeat_key(node_id: &str) -> String {
    format!("websocket:node:{node_id}:heartbeat")
}

fn node_clients_key(node_id: &str) -> String {
    format!("websocket:node:{node_id}:clients")
}

fn node_channels_key(node_id: &str) -> String {
    format!("websocket:node:{node_id}:channels")
}

fn client_node_key(client_id: &str) -> String {
    format!("websocket:client:{client_id}:node")
}

fn client_channels_key(client_id: &str) -> String {
    format!("websocket:client:{client_id}:channels")
}

fn client_metadata_key(client_id: &str) -> String {
    format!("websocket:client:{client_id}:metadata")
}

fn channel_nodes_key(channel: &str) -> String {
    format!("websocket:channel:{channel}:nodes")
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("kvps error: {0}")]
    Kvps(#[from] KvpsError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result of `getClusterInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub standalone: bool,
    #[serde(rename = "localNodeId")]
    pub local_node_id: String,
    pub nodes: Vec<NodeSummary>,
}

/// Static identity written once to `websocket:node:<id>:info`, separate from
/// the heartbeat so readers can tell "never registered" apart from "expired".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Owns this node's identity, its heartbeat loop, and the parts of the KVPS
/// keyspace that make up the directory: the `websocket:nodes` set, the
/// per-node info/heartbeat/clients/channels keys, the client→node directory,
/// and per-channel node-affinity sets.
pub struct NodeManager {
    node: Node,
    kvps: Arc<dyn Kvps>,
    connections: Arc<ConnectionCounter>,
    metrics: SharedMetricsCollector,
    heartbeat: HeartbeatConfig,
    local_clients: DashMap<String, ()>,
    channel_refcounts: DashMap<String, u32>,
    registered: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl NodeManager {
    pub fn new(
        node: Node,
        kvps: Arc<dyn Kvps>,
        connections: Arc<ConnectionCounter>,
        metrics: SharedMetricsCollector,
    ) -> Self {
        Self::with_heartbeat_config(node, kvps, connections, metrics, HeartbeatConfig::default())
    }

    pub fn with_heartbeat_config(
        node: Node,
        kvps: Arc<dyn Kvps>,
        connections: Arc<ConnectionCounter>,
        metrics: SharedMetricsCollector,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            node,
            kvps,
            connections,
            metrics,
            heartbeat,
            local_clients: DashMap::new(),
            channel_refcounts: DashMap::new(),
            registered: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn is_standalone(&self) -> bool {
        self.kvps.is_standalone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Writes this node's info and first heartbeat, adds it to the active
    /// node set, and spawns the periodic heartbeat task. Failure to reach the
    /// KVPS backend here is not fatal: the manager still registers locally
    /// and the next heartbeat tick will retry.
    pub async fn register(self: &Arc<Self>) -> Result<(), ManagerError> {
        let info = NodeInfo {
            hostname: self.node.hostname.clone(),
            started_at: self.node.started_at,
        };
        if let Err(e) = self.kvps.sadd(ACTIVE_NODES_KEY, &self.node.id).await {
            warn!(error = %e, "failed to add node to active set, continuing in degraded mode");
        }
        if let Err(e) = self
            .kvps
            .set(&node_info_key(&self.node.id), &serde_json::to_string(&info)?)
            .await
        {
            warn!(error = %e, "failed to write node info, continuing in degraded mode");
        }
        if let Err(e) = self.write_heartbeat().await {
            warn!(error = %e, "initial heartbeat write failed, continuing in degraded mode");
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.heartbeat_loop(rx).await;
        });

        self.registered.store(true, Ordering::SeqCst);
        debug!(node_id = %self.node.id, "node registered");
        Ok(())
    }

    async fn write_heartbeat(&self) -> Result<(), ManagerError> {
        let memory_usage = self.metrics.write().await.memory_usage_bytes();
        let heartbeat = NodeHeartbeat {
            timestamp: chrono::Utc::now(),
            uptime: self.node.uptime_secs(),
            connection_count: self.connections.get(),
            memory_usage,
        };
        let payload = serde_json::to_string(&heartbeat)?;
        self.kvps
            .set_ex(
                &node_heartbeat_key(&self.node.id),
                &payload,
                self.heartbeat.ttl_secs,
            )
            .await?;
        Ok(())
    }

    async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.heartbeat.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.write_heartbeat().await {
                        warn!(error = %e, "heartbeat write failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(node_id = %self.node.id, "heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn register_client(&self, client_id: &str) {
        self.local_clients.insert(client_id.to_string(), ());
        self.connections.increment();
    }

    /// Writes the client→node directory entry, adds the client to this
    /// node's client set, and seeds its (currently minimal) metadata hash.
    pub async fn write_client_directory(&self, client_id: &str) -> Result<(), ManagerError> {
        self.kvps
            .set(&client_node_key(client_id), &self.node.id)
            .await?;
        self.kvps
            .sadd(&node_clients_key(&self.node.id), client_id)
            .await?;
        let metadata = serde_json::json!({ "connectedAt": chrono::Utc::now() }).to_string();
        self.kvps
            .set(&client_metadata_key(client_id), &metadata)
            .await?;
        Ok(())
    }

    /// Tears down every directory entry for `client_id`. Idempotent: safe to
    /// call on a client that was never fully registered.
    pub async fn unregister_client(&self, client_id: &str) -> Result<(), ManagerError> {
        if self.local_clients.remove(client_id).is_some() {
            self.connections.decrement();
        }
        self.kvps
            .srem(&node_clients_key(&self.node.id), client_id)
            .await?;
        self.kvps.delete(&client_node_key(client_id)).await?;
        self.kvps.delete(&client_channels_key(client_id)).await?;
        self.kvps.delete(&client_metadata_key(client_id)).await?;
        Ok(())
    }

    pub fn is_local_client(&self, client_id: &str) -> bool {
        self.local_clients.contains_key(client_id)
    }

    /// Increments this node's local subscriber count for `channel` and
    /// records the client's membership. Returns `true` when this was the
    /// first local subscriber, i.e. the node should be added to the
    /// channel's node set.
    pub async fn subscribe_client_to_channel(
        &self,
        client_id: &str,
        channel: &str,
    ) -> Result<bool, ManagerError> {
        let became_first = {
            let mut count = self.channel_refcounts.entry(channel.to_string()).or_insert(0);
            let was_zero = *count == 0;
            *count += 1;
            was_zero
        };
        self.kvps
            .sadd(&client_channels_key(client_id), channel)
            .await?;
        if became_first {
            self.kvps
                .sadd(&channel_nodes_key(channel), &self.node.id)
                .await?;
            self.kvps
                .sadd(&node_channels_key(&self.node.id), channel)
                .await?;
        }
        Ok(became_first)
    }

    /// Decrements the local subscriber count and removes the client's
    /// membership. Returns `true` when it reached zero and the node was
    /// removed from the channel's node set.
    pub async fn unsubscribe_client_from_channel(
        &self,
        client_id: &str,
        channel: &str,
    ) -> Result<bool, ManagerError> {
        let became_empty = match self.channel_refcounts.get_mut(channel) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                *count == 0
            }
            _ => false,
        };
        self.kvps
            .srem(&client_channels_key(client_id), channel)
            .await?;
        if became_empty {
            self.channel_refcounts.remove(channel);
            self.kvps.srem(&channel_nodes_key(channel), &self.node.id).await?;
            self.kvps
                .srem(&node_channels_key(&self.node.id), channel)
                .await?;
        }
        Ok(became_empty)
    }

    pub async fn get_nodes_for_channel(&self, channel: &str) -> Result<Vec<String>, ManagerError> {
        if self.is_standalone() {
            return Ok(vec![self.node.id.clone()]);
        }
        Ok(self.kvps.smembers(&channel_nodes_key(channel)).await?)
    }

    pub async fn get_client_node(&self, client_id: &str) -> Result<Option<String>, ManagerError> {
        if self.local_clients.contains_key(client_id) {
            return Ok(Some(self.node.id.clone()));
        }
        Ok(self.kvps.get(&client_node_key(client_id)).await?)
    }

    /// Lists every node in `websocket:nodes` with its current heartbeat, if
    /// any. A node whose heartbeat TTL has expired is still listed (callers
    /// must tolerate a stale entry and treat it as dead) but carries no
    /// heartbeat payload.
    pub async fn get_cluster_info(&self) -> Result<ClusterInfo, ManagerError> {
        if self.is_standalone() {
            let memory_usage = self.metrics.write().await.memory_usage_bytes();
            let heartbeat = NodeHeartbeat {
                timestamp: chrono::Utc::now(),
                uptime: self.node.uptime_secs(),
                connection_count: self.connections.get(),
                memory_usage,
            };
            return Ok(ClusterInfo {
                standalone: true,
                local_node_id: self.node.id.clone(),
                nodes: vec![NodeSummary { id: self.node.id.clone(), heartbeat: Some(heartbeat) }],
            });
        }

        let mut nodes = Vec::new();
        for id in self.kvps.smembers(ACTIVE_NODES_KEY).await? {
            let heartbeat = match self.kvps.get(&node_heartbeat_key(&id)).await {
                Ok(Some(json)) => match serde_json::from_str::<NodeHeartbeat>(&json) {
                    Ok(heartbeat) => Some(heartbeat),
                    Err(e) => {
                        warn!(node_id = %id, error = %e, "unparseable heartbeat payload");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    error!(node_id = %id, error = %e, "failed to read heartbeat key");
                    None
                }
            };
            nodes.push(NodeSummary { id, heartbeat });
        }

        Ok(ClusterInfo {
            standalone: self.kvps.is_standalone(),
            local_node_id: self.node.id.clone(),
            nodes,
        })
    }

    pub fn local_connection_count(&self) -> u32 {
        self.connections.get()
    }

    /// Graceful shutdown: stops the heartbeat loop and removes every trace of
    /// this node from the directory — the channel node sets it belongs to,
    /// every client it hosts, and finally the node's own keys and its entry
    /// in the active node set. Best-effort: a KVPS error partway through is
    /// logged and the remaining cleanup still runs, since standing the
    /// process down outweighs a perfectly clean directory.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }

        let channels: Vec<String> = self
            .channel_refcounts
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for channel in channels {
            if let Err(e) = self.kvps.srem(&channel_nodes_key(&channel), &self.node.id).await {
                warn!(channel, error = %e, "failed to remove node from channel during shutdown");
            }
        }
        self.channel_refcounts.clear();

        let clients: Vec<String> = self.local_clients.iter().map(|e| e.key().clone()).collect();
        for client_id in clients {
            if let Err(e) = self.unregister_client(&client_id).await {
                warn!(client_id, error = %e, "failed to unregister client during shutdown");
            }
        }

        if let Err(e) = self.kvps.delete(&node_clients_key(&self.node.id)).await {
            warn!(error = %e, "failed to clear node clients key on shutdown");
        }
        if let Err(e) = self.kvps.delete(&node_channels_key(&self.node.id)).await {
            warn!(error = %e, "failed to clear node channels key on shutdown");
        }
        if let Err(e) = self.kvps.delete(&node_info_key(&self.node.id)).await {
            warn!(error = %e, "failed to clear node info key on shutdown");
        }
        if let Err(e) = self.kvps.delete(&node_heartbeat_key(&self.node.id)).await {
            warn!(error = %e, "failed to clear heartbeat key on shutdown");
        }
        if let Err(e) = self.kvps.srem(ACTIVE_NODES_KEY, &self.node.id).await {
            warn!(error = %e, "failed to remove node from active set on shutdown");
        }
    }
}
