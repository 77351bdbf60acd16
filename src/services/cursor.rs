//! Cursor service: live pointer/selection broadcasting with per-client
//! throttling and a TTL sweep so stale cursors disappear on their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::router::MessageRouter;

use super::{input_error, Service, ServiceResponse};

const SERVICE: &str = "cursor";
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(250);
pub const CURSOR_TTL: Duration = Duration::from_secs(30);
pub const CURSOR_CLEANUP: Duration = Duration::from_secs(10);

fn cursor_channel(channel: &str) -> String {
    format!("cursor:{channel}")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum Position {
    Freeform { x: f64, y: f64 },
    Table { row: u64, col: u64 },
    Text { position: u64 },
    Canvas { x: f64, y: f64, tool: String },
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    channel: String,
    position: Position,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChannelRequest {
    channel: String,
}

#[derive(Clone)]
struct CursorEntry {
    client_id: String,
    position: Value,
    metadata: Option<Value>,
    updated_at: Instant,
}

impl CursorEntry {
    fn to_json(&self) -> Value {
        json!({
            "clientId": self.client_id,
            "position": self.position,
            "metadata": self.metadata,
        })
    }
}

pub struct CursorService {
    router: Arc<MessageRouter>,
    /// channel -> clientId -> entry.
    cursors: DashMap<String, DashMap<String, CursorEntry>>,
    last_update: DashMap<String, Instant>,
}

impl CursorService {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            router,
            cursors: DashMap::new(),
            last_update: DashMap::new(),
        })
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> watch::Sender<bool> {
        let (tx, mut rx) = watch::channel(false);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CURSOR_CLEANUP);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.sweep_expired().await,
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        tx
    }

    async fn sweep_expired(&self) {
        let now = Instant::now();
        let channels: Vec<String> = self.cursors.iter().map(|e| e.key().clone()).collect();
        for channel in channels {
            let Some(clients) = self.cursors.get(&channel) else {
                continue;
            };
            let expired: Vec<String> = clients
                .iter()
                .filter(|e| now.duration_since(e.value().updated_at) > CURSOR_TTL)
                .map(|e| e.key().clone())
                .collect();
            drop(clients);

            for client_id in expired {
                if let Some(map) = self.cursors.get(&channel) {
                    map.remove(&client_id);
                }
                let payload = ServiceResponse::ok(
                    SERVICE,
                    "remove",
                    json!({ "clientId": client_id, "channel": channel }),
                )
                .to_json();
                if let Err(e) = self.router.send_to_channel(&cursor_channel(&channel), payload, None).await {
                    warn!(error = %e, channel, client_id, "cursor sweeper: publish failed");
                }
            }
        }
    }

    async fn update(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: UpdateRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "update", e.to_string()),
        };

        let now = Instant::now();
        let throttled = match self.last_update.get(client_id) {
            Some(last) if now.duration_since(*last) < THROTTLE_INTERVAL => true,
            _ => false,
        };
        if throttled {
            return ServiceResponse::ok_empty(SERVICE, "update");
        }
        self.last_update.insert(client_id.to_string(), now);

        let position = serde_json::to_value(&req.position).unwrap_or(Value::Null);
        let entry = CursorEntry {
            client_id: client_id.to_string(),
            position: position.clone(),
            metadata: req.metadata.clone(),
            updated_at: now,
        };
        self.cursors
            .entry(req.channel.clone())
            .or_default()
            .insert(client_id.to_string(), entry);

        let payload = ServiceResponse::ok(
            SERVICE,
            "update",
            json!({
                "clientId": client_id,
                "channel": req.channel,
                "position": position,
                "metadata": req.metadata,
                "timestamp": Utc::now(),
            }),
        )
        .to_json();
        if let Err(e) = self.router.send_to_channel(&cursor_channel(&req.channel), payload, None).await {
            warn!(error = %e, "cursor update: router publish failed");
        }

        ServiceResponse::ok_empty(SERVICE, "update")
    }

    fn snapshot(&self, channel: &str) -> Vec<Value> {
        self.cursors
            .get(channel)
            .map(|map| map.iter().map(|e| e.value().to_json()).collect())
            .unwrap_or_default()
    }

    async fn subscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "subscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .subscribe_to_channel(client_id, &cursor_channel(&req.channel))
            .await
        {
            warn!(error = %e, "cursor subscribe: router subscribe failed");
        }
        let cursors = self.snapshot(&req.channel);
        ServiceResponse::ok(SERVICE, "subscribe", json!({ "channel": req.channel, "cursors": cursors }))
    }

    async fn unsubscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "unsubscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .unsubscribe_from_channel(client_id, &cursor_channel(&req.channel))
            .await
        {
            warn!(error = %e, "cursor unsubscribe: router unsubscribe failed");
        }
        ServiceResponse::ok_empty(SERVICE, "unsubscribe")
    }

    async fn get(&self, _client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "get", e.to_string()),
        };
        let cursors = self.snapshot(&req.channel);
        ServiceResponse::ok(SERVICE, "get", json!({ "channel": req.channel, "cursors": cursors }))
    }
}

#[async_trait]
impl Service for CursorService {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn handle_action(&self, client_id: &str, action: &str, data: Value) -> ServiceResponse {
        match action {
            "update" => self.update(client_id, data).await,
            "subscribe" => self.subscribe(client_id, data).await,
            "unsubscribe" => self.unsubscribe(client_id, data).await,
            "get" => self.get(client_id, data).await,
            other => input_error(SERVICE, other, format!("unknown cursor action '{other}'")),
        }
    }

    async fn on_client_disconnect(&self, client_id: &str) {
        self.last_update.remove(client_id);
        for channel in self.cursors.iter() {
            channel.value().remove(client_id);
        }
    }

    fn stats(&self) -> Value {
        json!({ "channels": self.cursors.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, NodeManager};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;
    use crate::registry::ConnectionRegistry;

    fn make_service() -> Arc<CursorService> {
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
        CursorService::new(router)
    }

    #[tokio::test]
    async fn update_then_get_shows_cursor() {
        let svc = make_service();
        svc.handle_action(
            "alice",
            "update",
            json!({"channel": "board", "position": {"mode": "freeform", "x": 1.0, "y": 2.0}}),
        )
        .await;
        let resp = svc.handle_action("bob", "get", json!({"channel": "board"})).await;
        assert_eq!(resp.data.unwrap()["cursors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rapid_updates_are_throttled() {
        let svc = make_service();
        for i in 0..10 {
            svc.handle_action(
                "alice",
                "update",
                json!({"channel": "board", "position": {"mode": "freeform", "x": i as f64, "y": 0.0}}),
            )
            .await;
        }
        let resp = svc.handle_action("bob", "get", json!({"channel": "board"})).await;
        let cursors = resp.data.unwrap()["cursors"].clone();
        let entry = cursors.as_array().unwrap()[0].clone();
        assert_eq!(entry["position"]["x"], json!(0.0));
    }

    #[tokio::test]
    async fn disconnect_removes_cursor() {
        let svc = make_service();
        svc.handle_action(
            "alice",
            "update",
            json!({"channel": "board", "position": {"mode": "freeform", "x": 1.0, "y": 2.0}}),
        )
        .await;
        svc.on_client_disconnect("alice").await;
        let resp = svc.handle_action("bob", "get", json!({"channel": "board"})).await;
        assert!(resp.data.unwrap()["cursors"].as_array().unwrap().is_empty());
    }
}
