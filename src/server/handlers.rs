use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ingress;
use crate::server::state::AppState;

/// `GET /health` — 200 once this node has completed `register()`, even in
/// standalone mode (a node with no reachable KVPS backend is still healthy).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": if state.node_manager.is_registered() { "ok" } else { "starting" },
        "nodeId": state.node_manager.id(),
        "standalone": state.node_manager.is_standalone(),
    });
    let code = if state.node_manager.is_registered() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// `GET /cluster` — `getClusterInfo()` verbatim.
pub async fn cluster_info(State(state): State<AppState>) -> impl IntoResponse {
    match state.node_manager.get_cluster_info().await {
        Ok(info) => (StatusCode::OK, Json(serde_json::to_value(info).unwrap_or(json!({})))),
        Err(e) => {
            warn!(error = %e, "cluster info query failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() })))
        }
    }
}

/// `GET /stats` — local connection count plus each enabled service's own
/// `stats()`.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let services: serde_json::Map<String, serde_json::Value> = state
        .services
        .iter()
        .map(|(name, service)| (name.to_string(), service.stats()))
        .collect();

    Json(json!({
        "nodeId": state.router.node_id(),
        "localConnections": state.registry.local_count(),
        "services": services,
    }))
}

/// `GET /ws` — upgrades to the client WebSocket framing.
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let (mut egress_rx, force_close) = state.registry.register(&client_id);

    if let Err(e) = state.router.register_local_client(&client_id).await {
        warn!(client_id = %client_id, error = %e, "failed to register client with router");
    }

    let (mut sink, mut stream) = socket.split();

    let hello = json!({
        "type": "connection",
        "status": "connected",
        "clientId": client_id,
        "nodeId": state.router.node_id(),
        "enabledServices": *state.enabled_services,
        "timestamp": Utc::now(),
    });
    if sink.send(WsMessage::Text(hello.to_string().into())).await.is_err() {
        state.registry.unregister(&client_id);
        let _ = state.router.unregister_local_client(&client_id).await;
        return;
    }

    let mut egress_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = force_close.notified() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                msg = egress_rx.recv() => {
                    match msg {
                        Some(m) => {
                            if sink.send(m).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "websocket read error, closing");
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => {
                let reply = ingress::dispatch(&state.services, &client_id, &text).await;
                state.registry.send_to_local_client(&client_id, &reply);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    egress_task.abort();

    for service in state.services.values() {
        service.on_client_disconnect(&client_id).await;
    }
    if let Err(e) = state.router.unregister_local_client(&client_id).await {
        warn!(client_id = %client_id, error = %e, "failed to unregister client on disconnect");
    }
}
