//! Chat service: plain channel messaging with a short replay history.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::router::MessageRouter;

use super::{input_error, Service, ServiceResponse};

const SERVICE: &str = "chat";
const MAX_HISTORY: usize = 100;
const JOIN_REPLAY: usize = 20;
const MIN_MESSAGE_LEN: usize = 1;
const MAX_MESSAGE_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    id: String,
    #[serde(rename = "clientId")]
    client_id: String,
    channel: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ChannelRequest {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    channel: String,
    message: String,
    #[serde(default)]
    metadata: Option<Value>,
}

pub struct ChatService {
    router: Arc<MessageRouter>,
    history: DashMap<String, VecDeque<ChatMessage>>,
    /// Channels each client has joined through this service, so `send` can
    /// reject messages to a channel the client never joined.
    joined: DashMap<String, DashSet<String>>,
}

impl ChatService {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            history: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    fn has_joined(&self, client_id: &str, channel: &str) -> bool {
        self.joined
            .get(client_id)
            .map(|set| set.contains(channel))
            .unwrap_or(false)
    }

    fn push_history(&self, channel: &str, message: ChatMessage) {
        let mut ring = self.history.entry(channel.to_string()).or_default();
        if ring.len() >= MAX_HISTORY {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    fn recent(&self, channel: &str, limit: usize) -> Vec<ChatMessage> {
        self.history
            .get(channel)
            .map(|ring| ring.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    async fn join(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "join", e.to_string()),
        };
        if let Err(e) = self.router.subscribe_to_channel(client_id, &req.channel).await {
            warn!(error = %e, "chat join: router subscribe failed");
        }
        self.joined
            .entry(client_id.to_string())
            .or_default()
            .insert(req.channel.clone());

        let history = self.recent(&req.channel, JOIN_REPLAY);
        ServiceResponse::ok(SERVICE, "join", json!({ "channel": req.channel, "history": history }))
    }

    async fn leave(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "leave", e.to_string()),
        };
        if let Err(e) = self
            .router
            .unsubscribe_from_channel(client_id, &req.channel)
            .await
        {
            warn!(error = %e, "chat leave: router unsubscribe failed");
        }
        if let Some(set) = self.joined.get(client_id) {
            set.remove(&req.channel);
        }
        ServiceResponse::ok_empty(SERVICE, "leave")
    }

    async fn send(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: SendRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "send", e.to_string()),
        };
        if !self.has_joined(client_id, &req.channel) {
            return ServiceResponse::err(SERVICE, "send", "must join channel before sending");
        }
        let len = req.message.chars().count();
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&len) {
            return input_error(SERVICE, "send", "message must be 1..1000 characters");
        }

        let entry = ChatMessage {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            channel: req.channel.clone(),
            message: req.message,
            metadata: req.metadata,
            timestamp: Utc::now(),
        };
        self.push_history(&req.channel, entry.clone());

        let broadcast = ServiceResponse::ok(
            SERVICE,
            "message",
            json!({ "channel": entry.channel, "message": entry }),
        )
        .to_json();
        if let Err(e) = self.router.send_to_channel(&req.channel, broadcast, None).await {
            warn!(error = %e, "chat send: router publish failed");
        }

        let ack = json!({ "id": entry.id, "channel": entry.channel, "timestamp": entry.timestamp });
        if let Err(e) = self
            .router
            .send_to_client(client_id, ServiceResponse::ok(SERVICE, "sent", ack).to_json())
            .await
        {
            warn!(error = %e, "chat send: private ack failed");
        }

        ServiceResponse::ok_empty(SERVICE, "send")
    }

    async fn history_action(&self, _client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "history", e.to_string()),
        };
        let history = self.recent(&req.channel, MAX_HISTORY);
        ServiceResponse::ok(SERVICE, "history", json!({ "channel": req.channel, "history": history }))
    }
}

#[async_trait]
impl Service for ChatService {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn handle_action(&self, client_id: &str, action: &str, data: Value) -> ServiceResponse {
        match action {
            "join" => self.join(client_id, data).await,
            "leave" => self.leave(client_id, data).await,
            "send" => self.send(client_id, data).await,
            "history" => self.history_action(client_id, data).await,
            other => input_error(SERVICE, other, format!("unknown chat action '{other}'")),
        }
    }

    async fn on_client_disconnect(&self, client_id: &str) {
        self.joined.remove(client_id);
    }

    fn stats(&self) -> Value {
        json!({ "channels": self.history.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, NodeManager};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;
    use crate::registry::ConnectionRegistry;

    fn make_service() -> ChatService {
        let bus = crate::kvps::FakeBus::new();
        let (kvps, _rx) = FakeKvps::connect(&bus);
        let kvps: Arc<dyn crate::kvps::Kvps> = Arc::new(kvps);
        let node = Arc::new(NodeManager::new(
            crate::cluster::Node::new("test"),
            kvps.clone(),
            Arc::new(ConnectionCounter::default()),
            new_shared_collector(),
        ));
        let router = Arc::new(MessageRouter::new(node, kvps, Arc::new(ConnectionRegistry::new())));
        ChatService::new(router)
    }

    #[tokio::test]
    async fn send_without_join_is_rejected() {
        let svc = make_service();
        let resp = svc
            .handle_action("alice", "send", json!({"channel": "lobby", "message": "hi"}))
            .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn join_then_send_then_history() {
        let svc = make_service();
        let join = svc.handle_action("alice", "join", json!({"channel": "lobby"})).await;
        assert!(join.success);

        let send = svc
            .handle_action("alice", "send", json!({"channel": "lobby", "message": "hello"}))
            .await;
        assert!(send.success);

        let history = svc.handle_action("alice", "history", json!({"channel": "lobby"})).await;
        let entries = history.data.unwrap()["history"].as_array().unwrap().len();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let svc = make_service();
        svc.handle_action("alice", "join", json!({"channel": "lobby"})).await;
        for i in 0..(MAX_HISTORY + 10) {
            svc.handle_action("alice", "send", json!({"channel": "lobby", "message": format!("m{i}")}))
                .await;
        }
        let history = svc.handle_action("alice", "history", json!({"channel": "lobby"})).await;
        assert_eq!(history.data.unwrap()["history"].as_array().unwrap().len(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let svc = make_service();
        svc.handle_action("alice", "join", json!({"channel": "lobby"})).await;
        let resp = svc
            .handle_action("alice", "send", json!({"channel": "lobby", "message": ""}))
            .await;
        assert!(!resp.success);
    }
}
