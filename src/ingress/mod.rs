//! Ingress Dispatcher: parses the client envelope `{service, action, ...}`
//! and routes it to the matching fan-out service, returning a uniform error
//! shape for anything it can't route.

use serde::Deserialize;
use serde_json::Value;

use crate::services::{Service, ServiceRegistry, ServiceResponse};

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    service: String,
    action: String,
    #[serde(flatten)]
    data: Value,
}

/// Parses one client frame and dispatches it to the matching service.
/// Always returns a reply frame — an unroutable request produces a
/// `{type: "error", ...}` frame rather than silently dropping the
/// connection's turn.
pub async fn dispatch(registry: &ServiceRegistry, client_id: &str, raw: &str) -> Value {
    let envelope: RequestEnvelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => return error_frame("malformed request", &e.to_string()),
    };

    let Some(service) = registry.get(envelope.service.as_str()) else {
        return error_frame(&envelope.action, &format!("unknown service '{}'", envelope.service));
    };

    service
        .handle_action(client_id, &envelope.action, envelope.data)
        .await
        .to_json()
}

fn error_frame(action: &str, message: &str) -> Value {
    ServiceResponse::err("error", action, message).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConnectionCounter, NodeManager};
    use crate::kvps::FakeKvps;
    use crate::metrics::new_shared_collector;
    use crate::registry::ConnectionRegistry;
    use crate::services::build_registry;
    use std::sync::Arc;

    fn make_registry() -> ServiceRegistry {
        let bus = crate::kvps::FakeBus::new();
        let (kvps, _rx) = FakeKvps::connect(&bus);
        let kvps: Arc<dyn crate::kvps::Kvps> = Arc::new(kvps);
        let node = Arc::new(NodeManager::new(
            crate::cluster::Node::new("test"),
            kvps.clone(),
            Arc::new(ConnectionCounter::default()),
            new_shared_collector(),
        ));
        let router = Arc::new(crate::router::MessageRouter::new(node, kvps, Arc::new(ConnectionRegistry::new())));
        let (registry, _sweepers) = build_registry(
            &["chat".to_string(), "presence".to_string(), "cursor".to_string(), "reaction".to_string()],
            router,
        );
        registry
    }

    #[tokio::test]
    async fn unknown_service_returns_error_frame() {
        let registry = make_registry();
        let reply = dispatch(&registry, "alice", r#"{"service":"ghost","action":"noop"}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn malformed_json_returns_error_frame() {
        let registry = make_registry();
        let reply = dispatch(&registry, "alice", "not json").await;
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn known_service_action_dispatches() {
        let registry = make_registry();
        let reply = dispatch(&registry, "alice", r#"{"service":"chat","action":"join","channel":"lobby"}"#).await;
        assert_eq!(reply["type"], "chat");
        assert_eq!(reply["success"], true);
    }
}
