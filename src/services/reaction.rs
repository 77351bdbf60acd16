//! Reaction service: ephemeral emoji reactions against a fixed catalog.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::router::MessageRouter;

use super::{input_error, Service, ServiceResponse};

const SERVICE: &str = "reaction";
const MAX_RING: usize = 50;

/// Fixed emoji → effect-name catalog. `send` rejects anything not listed
/// here.
const CATALOG: &[(&str, &str)] = &[
    ("\u{1F389}", "confetti"), // 🎉
    ("\u{2764}\u{FE0F}", "hearts"), // ❤️
    ("\u{1F44D}", "thumbsup"), // 👍
    ("\u{1F602}", "laugh"), // 😂
    ("\u{1F525}", "fire"), // 🔥
    ("\u{1F44F}", "applause"), // 👏
];

fn effect_for(emoji: &str) -> Option<&'static str> {
    CATALOG.iter().find(|(e, _)| *e == emoji).map(|(_, effect)| *effect)
}

fn reactions_channel(channel: &str) -> String {
    format!("reactions:{channel}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReactionEvent {
    id: String,
    #[serde(rename = "clientId")]
    client_id: String,
    channel: String,
    emoji: String,
    effect: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<Value>,
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
    emoji: String,
    #[serde(default)]
    position: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

pub struct ReactionService {
    router: Arc<MessageRouter>,
    ring: DashMap<String, VecDeque<ReactionEvent>>,
}

impl ReactionService {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router, ring: DashMap::new() }
    }

    async fn subscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "subscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .subscribe_to_channel(client_id, &reactions_channel(&req.channel))
            .await
        {
            warn!(error = %e, "reaction subscribe: router subscribe failed");
        }
        ServiceResponse::ok_empty(SERVICE, "subscribe")
    }

    async fn unsubscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "unsubscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .unsubscribe_from_channel(client_id, &reactions_channel(&req.channel))
            .await
        {
            warn!(error = %e, "reaction unsubscribe: router unsubscribe failed");
        }
        ServiceResponse::ok_empty(SERVICE, "unsubscribe")
    }

    async fn send(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: SendRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "send", e.to_string()),
        };
        let Some(effect) = effect_for(&req.emoji) else {
            return input_error(SERVICE, "send", format!("unknown emoji '{}'", req.emoji));
        };

        let event = ReactionEvent {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            channel: req.channel.clone(),
            emoji: req.emoji,
            effect,
            position: req.position,
            metadata: req.metadata,
            timestamp: Utc::now(),
        };

        let mut ring = self.ring.entry(req.channel.clone()).or_default();
        if ring.len() >= MAX_RING {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        drop(ring);

        let payload = ServiceResponse::ok(
            SERVICE,
            "reaction",
            serde_json::to_value(&event).unwrap_or(Value::Null),
        )
        .to_json();
        if let Err(e) = self
            .router
            .send_to_channel(&reactions_channel(&req.channel), payload, None)
            .await
        {
            warn!(error = %e, "reaction send: router publish failed");
        }

        let ack = json!({ "id": event.id, "channel": event.channel, "timestamp": event.timestamp });
        if let Err(e) = self
            .router
            .send_to_client(client_id, ServiceResponse::ok(SERVICE, "reaction_sent", ack).to_json())
            .await
        {
            warn!(error = %e, "reaction send: private ack failed");
        }

        ServiceResponse::ok_empty(SERVICE, "send")
    }

    fn get_available(&self) -> ServiceResponse {
        let emojis: Vec<Value> = CATALOG
            .iter()
            .map(|(emoji, effect)| json!({ "emoji": emoji, "effect": effect }))
            .collect();
        ServiceResponse::ok(SERVICE, "getAvailable", json!({ "emojis": emojis }))
    }
}

#[async_trait]
impl Service for ReactionService {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn handle_action(&self, client_id: &str, action: &str, data: Value) -> ServiceResponse {
        match action {
            "subscribe" => self.subscribe(client_id, data).await,
            "unsubscribe" => self.unsubscribe(client_id, data).await,
            "send" => self.send(client_id, data).await,
            "getAvailable" => self.get_available(),
            other => input_error(SERVICE, other, format!("unknown reaction action '{other}'")),
        }
    }

    fn stats(&self) -> Value {
        json!({ "channels": self.ring.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, NodeManager};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;
    use crate::registry::ConnectionRegistry;

    fn make_service() -> ReactionService {
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
        ReactionService::new(router)
    }

    #[tokio::test]
    async fn unknown_emoji_is_rejected() {
        let svc = make_service();
        let resp = svc
            .handle_action("alice", "send", json!({"channel": "lobby", "emoji": "\u{1F916}"}))
            .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn known_emoji_is_recorded() {
        let svc = make_service();
        let resp = svc
            .handle_action("alice", "send", json!({"channel": "lobby", "emoji": "\u{1F389}"}))
            .await;
        assert!(resp.success);
        assert_eq!(svc.ring.get("lobby").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let svc = make_service();
        for _ in 0..(MAX_RING + 5) {
            svc.handle_action("alice", "send", json!({"channel": "lobby", "emoji": "\u{1F389}"}))
                .await;
        }
        assert_eq!(svc.ring.get("lobby").unwrap().len(), MAX_RING);
    }

    #[test]
    fn get_available_lists_catalog() {
        let svc = make_service();
        let resp = svc.get_available();
        assert_eq!(resp.data.unwrap()["emojis"].as_array().unwrap().len(), CATALOG.len());
    }
}
