//! Presence service: per-client status tracking with a heartbeat-driven
//! offline sweeper. `set` never implicitly subscribes the caller to a
//! channel's presence feed — that's a separate, explicit `subscribe`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::router::MessageRouter;

use super::{input_error, Service, ServiceResponse};

const SERVICE: &str = "presence";
/// How long a client can go without a heartbeat before the sweeper marks it
/// offline.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PresenceRecord {
    status: PresenceStatus,
    #[serde(rename = "lastSeen")]
    last_seen: DateTime<Utc>,
}

fn presence_channel(channel: &str) -> String {
    format!("presence:{channel}")
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
struct GetRequest {
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelRequest {
    channel: String,
}

pub struct PresenceService {
    router: Arc<MessageRouter>,
    records: DashMap<String, PresenceRecord>,
    /// Channels each client has explicitly subscribed its presence feed to.
    channels: DashMap<String, DashSet<String>>,
}

impl PresenceService {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            router,
            records: DashMap::new(),
            channels: DashMap::new(),
        })
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> watch::Sender<bool> {
        let (tx, mut rx) = watch::channel(false);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
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
        let now = Utc::now();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|e| {
                e.value().status != PresenceStatus::Offline
                    && (now - e.value().last_seen).to_std().unwrap_or_default() > PRESENCE_TIMEOUT
            })
            .map(|e| e.key().clone())
            .collect();

        for client_id in expired {
            self.records.alter(&client_id, |_, mut record| {
                record.status = PresenceStatus::Offline;
                record
            });
            if let Err(e) = self.publish_change(&client_id, PresenceStatus::Offline).await {
                warn!(error = %e, client_id, "presence sweeper: publish failed");
            }
        }
    }

    async fn publish_change(&self, client_id: &str, status: PresenceStatus) -> Result<(), crate::router::RouterError> {
        let Some(channels) = self.channels.get(client_id) else {
            return Ok(());
        };
        let payload = ServiceResponse::ok(
            SERVICE,
            "update",
            json!({ "clientId": client_id, "status": status, "timestamp": Utc::now() }),
        )
        .to_json();
        for channel in channels.iter() {
            self.router
                .send_to_channel(&presence_channel(channel.as_str()), payload.clone(), None)
                .await?;
        }
        Ok(())
    }

    async fn set(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: SetRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "set", e.to_string()),
        };
        let Some(status) = PresenceStatus::parse(&req.status) else {
            return input_error(SERVICE, "set", format!("unknown status '{}'", req.status));
        };
        self.records.insert(
            client_id.to_string(),
            PresenceRecord { status, last_seen: Utc::now() },
        );
        if let Err(e) = self.publish_change(client_id, status).await {
            warn!(error = %e, "presence set: publish failed");
        }
        ServiceResponse::ok_empty(SERVICE, "set")
    }

    async fn get(&self, _client_id: &str, data: Value) -> ServiceResponse {
        let req: GetRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "get", e.to_string()),
        };
        let record = self.records.get(&req.client_id);
        let body = match record {
            Some(r) => json!({ "clientId": req.client_id, "status": r.status, "lastSeen": r.last_seen }),
            None => json!({ "clientId": req.client_id, "status": PresenceStatus::Offline, "lastSeen": Value::Null }),
        };
        ServiceResponse::ok(SERVICE, "get", body)
    }

    async fn subscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "subscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .subscribe_to_channel(client_id, &presence_channel(&req.channel))
            .await
        {
            warn!(error = %e, "presence subscribe: router subscribe failed");
        }
        self.channels
            .entry(client_id.to_string())
            .or_default()
            .insert(req.channel);
        ServiceResponse::ok_empty(SERVICE, "subscribe")
    }

    async fn unsubscribe(&self, client_id: &str, data: Value) -> ServiceResponse {
        let req: ChannelRequest = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => return input_error(SERVICE, "unsubscribe", e.to_string()),
        };
        if let Err(e) = self
            .router
            .unsubscribe_from_channel(client_id, &presence_channel(&req.channel))
            .await
        {
            warn!(error = %e, "presence unsubscribe: router unsubscribe failed");
        }
        if let Some(set) = self.channels.get(client_id) {
            set.remove(&req.channel);
        }
        ServiceResponse::ok_empty(SERVICE, "unsubscribe")
    }

    async fn heartbeat(&self, client_id: &str, _data: Value) -> ServiceResponse {
        if let Some(mut record) = self.records.get_mut(client_id) {
            record.last_seen = Utc::now();
        } else {
            self.records.insert(
                client_id.to_string(),
                PresenceRecord { status: PresenceStatus::Online, last_seen: Utc::now() },
            );
        }
        ServiceResponse::ok_empty(SERVICE, "heartbeat")
    }
}

#[async_trait]
impl Service for PresenceService {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn handle_action(&self, client_id: &str, action: &str, data: Value) -> ServiceResponse {
        match action {
            "set" => self.set(client_id, data).await,
            "get" => self.get(client_id, data).await,
            "subscribe" => self.subscribe(client_id, data).await,
            "unsubscribe" => self.unsubscribe(client_id, data).await,
            "heartbeat" => self.heartbeat(client_id, data).await,
            other => input_error(SERVICE, other, format!("unknown presence action '{other}'")),
        }
    }

    async fn on_client_disconnect(&self, client_id: &str) {
        if let Some(mut record) = self.records.get_mut(client_id) {
            record.status = PresenceStatus::Offline;
        }
        if let Err(e) = self.publish_change(client_id, PresenceStatus::Offline).await {
            warn!(error = %e, client_id, "presence disconnect: publish failed");
        }
        self.channels.remove(client_id);
        self.records.remove(client_id);
    }

    fn stats(&self) -> Value {
        json!({ "tracked_clients": self.records.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, NodeManager};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;
    use crate::registry::ConnectionRegistry;

    fn make_service() -> Arc<PresenceService> {
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
        PresenceService::new(router)
    }

    #[tokio::test]
    async fn unknown_status_is_rejected() {
        let svc = make_service();
        let resp = svc.handle_action("alice", "set", json!({"status": "furious"})).await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let svc = make_service();
        svc.handle_action("alice", "set", json!({"status": "online"})).await;
        let resp = svc.handle_action("bob", "get", json!({"clientId": "alice"})).await;
        assert_eq!(resp.data.unwrap()["status"], json!("online"));
    }

    #[tokio::test]
    async fn get_unknown_client_defaults_offline() {
        let svc = make_service();
        let resp = svc.handle_action("bob", "get", json!({"clientId": "ghost"})).await;
        assert_eq!(resp.data.unwrap()["status"], json!("offline"));
    }

    #[tokio::test]
    async fn disconnect_marks_offline() {
        let svc = make_service();
        svc.handle_action("alice", "set", json!({"status": "online"})).await;
        svc.on_client_disconnect("alice").await;
        let resp = svc.handle_action("bob", "get", json!({"clientId": "alice"})).await;
        assert_eq!(resp.data.unwrap()["status"], json!("offline"));
    }
}
