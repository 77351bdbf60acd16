//! Fan-out services: chat, presence, cursor, reactions. Each is a pure
//! consumer of the [`MessageRouter`] — it owns its own in-memory per-channel
//! state and validation rules, and never touches the connection registry or
//! the KVPS adapter directly.

pub mod chat;
pub mod cursor;
pub mod presence;
pub mod reaction;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

/// One of the four service names recognized on the client envelope's
/// `service` field, used to key the dispatch table built at startup.
pub const SERVICE_NAMES: [&str; 4] = ["chat", "presence", "cursor", "reaction"];

/// Uniform reply shape every service produces:
/// `{type: <service>, action, success?, data|error, timestamp}`.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub service: &'static str,
    pub action: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ServiceResponse {
    pub fn ok(service: &'static str, action: impl Into<String>, data: Value) -> Self {
        Self {
            service,
            action: action.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty(service: &'static str, action: impl Into<String>) -> Self {
        Self {
            service,
            action: action.into(),
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(service: &'static str, action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            service,
            action: action.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": self.service,
            "action": self.action,
            "success": self.success,
            "data": self.data,
            "error": self.error,
            "timestamp": Utc::now(),
        })
    }
}

/// Capability every fan-out service implements. `on_client_disconnect` and
/// `stats` are optional hooks — the defaults are no-ops so a service that
/// doesn't need per-client teardown or expose stats doesn't have to say so.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_action(&self, client_id: &str, action: &str, data: Value) -> ServiceResponse;

    async fn on_client_disconnect(&self, _client_id: &str) {}

    fn stats(&self) -> Value {
        json!({})
    }
}

/// Closed dispatch table from service name to implementation, built once at
/// startup from the `ENABLED_SERVICES` configuration.
pub type ServiceRegistry = HashMap<&'static str, Arc<dyn Service>>;

fn input_error(service: &'static str, action: &str, message: impl Into<String>) -> ServiceResponse {
    ServiceResponse::err(service, action, message)
}

/// Background handles a caller should keep alive for the lifetime of the
/// process; dropping (or signalling) them stops the corresponding sweeper.
pub struct ServiceSweepers {
    pub presence_shutdown: tokio::sync::watch::Sender<bool>,
    pub cursor_shutdown: tokio::sync::watch::Sender<bool>,
}

/// Builds the closed dispatch table for the services named in `enabled`,
/// wiring each to the shared router. Unknown names are ignored; an empty
/// `enabled` list yields an empty registry (no service traffic is ever
/// dispatched, but the ingress dispatcher still runs).
pub fn build_registry(
    enabled: &[String],
    router: Arc<crate::router::MessageRouter>,
) -> (ServiceRegistry, ServiceSweepers) {
    let mut registry: ServiceRegistry = HashMap::new();

    let presence = presence::PresenceService::new(Arc::clone(&router));
    let presence_shutdown = presence.spawn_sweeper();
    let cursor = cursor::CursorService::new(Arc::clone(&router));
    let cursor_shutdown = cursor.spawn_sweeper();

    for name in enabled {
        match name.as_str() {
            "chat" => {
                registry.insert("chat", Arc::new(chat::ChatService::new(Arc::clone(&router))));
            }
            "presence" => {
                registry.insert("presence", presence.clone());
            }
            "cursor" => {
                registry.insert("cursor", cursor.clone());
            }
            "reaction" => {
                registry.insert("reaction", Arc::new(reaction::ReactionService::new(Arc::clone(&router))));
            }
            other => tracing::warn!(service = other, "ignoring unknown entry in ENABLED_SERVICES"),
        }
    }

    (registry, ServiceSweepers { presence_shutdown, cursor_shutdown })
}
