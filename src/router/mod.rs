//! Message Router: the fan-out core that sits between the connection
//! registry, the node manager's directory, and the KVPS pub/sub channels.
//!
//! A message reaches a client in one of three ways: it was written directly
//! to a locally-registered client (`sendToClient` resolving to this node),
//! it arrived as a `channel_message` envelope on `websocket:route:<channel>`
//! from another node, or it arrived as a `broadcast` envelope on
//! `websocket:broadcast:all`. In standalone mode (no reachable KVPS backend)
//! every send degrades to local-only fan-out — the router never propagates
//! an error to a client over unreachable infrastructure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::{ManagerError, NodeManager};
use crate::kvps::{Kvps, KvpsError, KvpsMessage, MessageReceiver};
use crate::registry::ConnectionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Kvps(#[from] KvpsError),

    #[error("envelope serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Tag of a router envelope published over KVPS pub/sub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    DirectMessage,
    Broadcast,
    ChannelMessage,
}

/// The wire shape published to `websocket:direct:<nodeId>`,
/// `websocket:broadcast:all`, and `websocket:route:<channel>`. Every field
/// besides `type`, `message`, `fromNode`, and `timestamp` is optional and
/// only meaningful for some envelope kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "clientId")]
    pub client_id: Option<String>,
    pub message: Value,
    #[serde(skip_serializing_if = "Option::is_none", rename = "excludeClientId")]
    pub exclude_client_id: Option<String>,
    #[serde(rename = "fromNode")]
    pub from_node: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "targetNodes")]
    pub target_nodes: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

fn route_channel_name(channel: &str) -> String {
    format!("websocket:route:{channel}")
}

fn direct_channel_name(node_id: &str) -> String {
    format!("websocket:direct:{node_id}")
}

const BROADCAST_CHANNEL: &str = "websocket:broadcast:all";

/// Local, per-node fan-out core. Sits in front of the node manager's
/// directory and the connection registry; services and the ingress
/// dispatcher never touch either of those directly.
pub struct MessageRouter {
    node: Arc<NodeManager>,
    kvps: Arc<dyn Kvps>,
    registry: Arc<ConnectionRegistry>,
    /// Per-client set of channels this node currently has them subscribed
    /// to, used to unwind subscriptions on disconnect and to skip redundant
    /// subscribe/unsubscribe calls.
    client_channels: DashMap<String, DashSet<String>>,
    /// Reverse index for local fan-out: channel -> locally subscribed client
    /// ids. Kept in lockstep with `client_channels`.
    channel_clients: DashMap<String, DashSet<String>>,
}

impl MessageRouter {
    pub fn new(node: Arc<NodeManager>, kvps: Arc<dyn Kvps>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            node,
            kvps,
            registry,
            client_channels: DashMap::new(),
            channel_clients: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    /// Registers a freshly-connected client with the node manager and the
    /// directory. Must be called before any `subscribeToChannel` call for
    /// the same client.
    pub async fn register_local_client(&self, client_id: &str) -> Result<(), RouterError> {
        self.node.register_client(client_id);
        self.node.write_client_directory(client_id).await?;
        self.client_channels.insert(client_id.to_string(), DashSet::new());
        Ok(())
    }

    /// Unsubscribes the client from every channel it joined, tears down its
    /// directory entries, and removes it from the connection registry.
    /// Idempotent: safe to call more than once for the same client.
    pub async fn unregister_local_client(&self, client_id: &str) -> Result<(), RouterError> {
        if let Some((_, channels)) = self.client_channels.remove(client_id) {
            for channel in channels.iter() {
                self.unsubscribe_from_channel(client_id, channel.as_str()).await?;
            }
        }
        self.node.unregister_client(client_id).await?;
        self.registry.unregister(client_id);
        Ok(())
    }

    /// Subscribes a local client to `channel`. Issues a KVPS subscribe only
    /// when this node had no prior local subscriber for the channel.
    pub async fn subscribe_to_channel(&self, client_id: &str, channel: &str) -> Result<(), RouterError> {
        let newly_subscribed = self
            .client_channels
            .entry(client_id.to_string())
            .or_insert_with(DashSet::new)
            .insert(channel.to_string());
        if !newly_subscribed {
            return Ok(());
        }
        self.channel_clients
            .entry(channel.to_string())
            .or_insert_with(DashSet::new)
            .insert(client_id.to_string());

        let became_first = self.node.subscribe_client_to_channel(client_id, channel).await?;
        if became_first {
            self.kvps.subscribe(&route_channel_name(channel)).await?;
        }
        Ok(())
    }

    /// Unsubscribes a local client from `channel`. Issues a KVPS unsubscribe
    /// only when this was the node's last local subscriber for the channel.
    pub async fn unsubscribe_from_channel(&self, client_id: &str, channel: &str) -> Result<(), RouterError> {
        let removed = self
            .client_channels
            .get(client_id)
            .map(|set| set.remove(channel).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(());
        }
        if let Some(clients) = self.channel_clients.get(channel) {
            clients.remove(client_id);
        }

        let became_empty = self
            .node
            .unsubscribe_client_from_channel(client_id, channel)
            .await?;
        if became_empty {
            self.kvps.unsubscribe(&route_channel_name(channel)).await?;
        }
        Ok(())
    }

    /// Sends `message` to every subscriber of `channel` across the cluster.
    /// In standalone mode this fans out locally only. `excludeClientId` is
    /// applied uniformly at local-dispatch time on every node, including the
    /// originator, never by omitting a node from the publish itself.
    pub async fn send_to_channel(
        &self,
        channel: &str,
        message: Value,
        exclude_client_id: Option<&str>,
    ) -> Result<(), RouterError> {
        if self.kvps.is_standalone() {
            self.fan_out_locally(channel, &message, exclude_client_id).await;
            return Ok(());
        }

        let target_nodes = self.node.get_nodes_for_channel(channel).await?;
        if target_nodes.is_empty() {
            debug!(channel, "no subscribed nodes, dropping channel message");
            return Ok(());
        }

        let envelope = Envelope {
            kind: EnvelopeKind::ChannelMessage,
            channel: Some(channel.to_string()),
            client_id: None,
            message,
            exclude_client_id: exclude_client_id.map(|s| s.to_string()),
            from_node: self.node.id().to_string(),
            target_nodes: Some(target_nodes),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.kvps.publish(&route_channel_name(channel), &payload).await?;
        Ok(())
    }

    /// Sends `message` to one client, wherever in the cluster it lives.
    pub async fn send_to_client(&self, client_id: &str, message: Value) -> Result<(), RouterError> {
        if self.registry.contains(client_id) {
            self.registry.send_to_local_client(client_id, &message);
            return Ok(());
        }
        if self.kvps.is_standalone() {
            debug!(client_id, "client not local and running standalone, dropping");
            return Ok(());
        }

        let Some(target_node) = self.node.get_client_node(client_id).await? else {
            debug!(client_id, "client not found in directory, dropping");
            return Ok(());
        };

        let envelope = Envelope {
            kind: EnvelopeKind::DirectMessage,
            channel: None,
            client_id: Some(client_id.to_string()),
            message,
            exclude_client_id: None,
            from_node: self.node.id().to_string(),
            target_nodes: None,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.kvps.publish(&direct_channel_name(&target_node), &payload).await?;
        Ok(())
    }

    /// Sends `message` to every connected client cluster-wide.
    pub async fn broadcast_to_all(&self, message: Value, exclude_client_id: Option<&str>) -> Result<(), RouterError> {
        self.registry.broadcast_local(&message, exclude_client_id);
        if self.kvps.is_standalone() {
            return Ok(());
        }

        let envelope = Envelope {
            kind: EnvelopeKind::Broadcast,
            channel: None,
            client_id: None,
            message,
            exclude_client_id: exclude_client_id.map(|s| s.to_string()),
            from_node: self.node.id().to_string(),
            target_nodes: None,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.kvps.publish(BROADCAST_CHANNEL, &payload).await?;
        Ok(())
    }

    /// Delivers `message` to every local client subscribed to `channel`.
    /// A client whose send fails is torn down rather than left dangling.
    async fn fan_out_locally(&self, channel: &str, message: &Value, exclude_client_id: Option<&str>) {
        let Some(clients) = self.channel_clients.get(channel) else {
            return;
        };
        let recipients: Vec<String> = clients.iter().map(|c| c.key().clone()).collect();
        drop(clients);

        for client_id in recipients {
            if Some(client_id.as_str()) == exclude_client_id {
                continue;
            }
            if !self.registry.send_to_local_client(&client_id, message) {
                if let Err(e) = self.unregister_local_client(&client_id).await {
                    warn!(client_id, error = %e, "failed to unregister client after failed send");
                }
            }
        }
    }

    /// Background task: drains `rx` for the lifetime of the process,
    /// applying each inbound envelope to the local registry. Run this once
    /// per node after the KVPS subscriber actor is connected.
    pub async fn run_inbound_loop(self: Arc<Self>, mut rx: MessageReceiver) {
        while let Some(KvpsMessage { channel: _, payload }) = rx.recv().await {
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(e) => warn!(error = %e, "unparseable router envelope, dropping"),
            }
        }
        debug!("router inbound loop stopped: kvps message channel closed");
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::DirectMessage => {
                if let Some(client_id) = &envelope.client_id {
                    if !self.registry.send_to_local_client(client_id, &envelope.message) {
                        debug!(client_id, "direct message target not found locally, dropping");
                    }
                }
            }
            EnvelopeKind::Broadcast => {
                if envelope.from_node == self.node.id() {
                    return;
                }
                self.registry
                    .broadcast_local(&envelope.message, envelope.exclude_client_id.as_deref());
            }
            EnvelopeKind::ChannelMessage => {
                if let Some(targets) = &envelope.target_nodes {
                    if !targets.iter().any(|n| n == self.node.id()) {
                        return;
                    }
                }
                let Some(channel) = envelope.channel.as_deref() else {
                    return;
                };
                self.fan_out_locally(channel, &envelope.message, envelope.exclude_client_id.as_deref())
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, Node};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;

    fn make_router(bus: &crate::kvps::FakeBus, hostname: &str) -> (Arc<MessageRouter>, MessageReceiver) {
        let (kvps, rx) = FakeKvps::connect(bus);
        let kvps: Arc<dyn Kvps> = Arc::new(kvps);
        let node = Arc::new(NodeManager::new(
            Node::new(hostname),
            kvps.clone(),
            Arc::new(ConnectionCounter::default()),
            new_shared_collector(),
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        (Arc::new(MessageRouter::new(node, kvps, registry)), rx)
    }

    #[tokio::test]
    async fn two_node_channel_fan_out() {
        let bus = crate::kvps::FakeBus::new();
        let (router_a, rx_a) = make_router(&bus, "node-a");
        let (router_b, rx_b) = make_router(&bus, "node-b");
        tokio::spawn(router_a.clone().run_inbound_loop(rx_a));
        tokio::spawn(router_b.clone().run_inbound_loop(rx_b));

        router_a.register_local_client("alice").await.unwrap();
        router_b.register_local_client("bob").await.unwrap();

        let (rx_alice, _fc) = router_a.registry.register("alice");
        let (rx_bob, _fc) = router_b.registry.register("bob");
        let mut rx_alice = rx_alice;
        let mut rx_bob = rx_bob;

        router_a.subscribe_to_channel("alice", "lobby").await.unwrap();
        router_b.subscribe_to_channel("bob", "lobby").await.unwrap();

        router_a
            .send_to_channel("lobby", serde_json::json!({"text": "hi"}), None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(rx_alice.try_recv().is_ok());
        assert!(rx_bob.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_only_reaches_targeted_nodes() {
        let bus = crate::kvps::FakeBus::new();
        let (router_a, rx_a) = make_router(&bus, "node-a");
        let (router_b, rx_b) = make_router(&bus, "node-b");
        let (router_c, rx_c) = make_router(&bus, "node-c");
        tokio::spawn(router_a.clone().run_inbound_loop(rx_a));
        tokio::spawn(router_b.clone().run_inbound_loop(rx_b));
        tokio::spawn(router_c.clone().run_inbound_loop(rx_c));

        router_b.register_local_client("bob").await.unwrap();
        let (mut rx_bob, _fc) = router_b.registry.register("bob");
        router_b.subscribe_to_channel("bob", "lobby").await.unwrap();

        router_a
            .send_to_channel("lobby", serde_json::json!({"text": "hi"}), None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx_bob.try_recv().is_ok());
        assert_eq!(router_c.channel_clients.len(), 0);
    }

    #[tokio::test]
    async fn standalone_mode_fans_out_locally_without_kvps_publish() {
        let bus = crate::kvps::FakeBus::new();
        let (fake, rx) = FakeKvps::connect(&bus);
        let kvps: Arc<dyn Kvps> = Arc::new(fake);
        let node = Arc::new(NodeManager::new(
            Node::new("solo"),
            kvps.clone(),
            Arc::new(ConnectionCounter::default()),
            new_shared_collector(),
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(node, kvps, registry));
        drop(rx);

        router.register_local_client("alice").await.unwrap();
        let (mut rx_alice, _fc) = router.registry.register("alice");
        router.subscribe_to_channel("alice", "lobby").await.unwrap();

        router
            .send_to_channel("lobby", serde_json::json!({"text": "hi"}), None)
            .await
            .unwrap();

        assert!(rx_alice.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_unwinds_channel_subscriptions() {
        let bus = crate::kvps::FakeBus::new();
        let (router, rx) = make_router(&bus, "node-a");
        tokio::spawn(router.clone().run_inbound_loop(rx));

        router.register_local_client("alice").await.unwrap();
        router.subscribe_to_channel("alice", "lobby").await.unwrap();
        router.unregister_local_client("alice").await.unwrap();

        let nodes = router.node.get_nodes_for_channel("lobby").await.unwrap();
        assert!(nodes.is_empty());
    }
}
