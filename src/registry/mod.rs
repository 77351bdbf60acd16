//! Connection Registry: the local, per-node map from client id to its
//! WebSocket egress. `sendToLocalClient` is the only thing the router and
//! services need from it; a client whose egress is gone or backed up
//! degrades silently rather than blocking the caller.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Bounded send queue depth per connection before it is force-closed.
pub const SEND_QUEUE_CAPACITY: usize = 64;
/// Close code used when a client's send queue overflows.
pub const CLOSE_CODE_OVERFLOW: u16 = 1013;
/// Close code used on graceful node shutdown.
pub const CLOSE_CODE_SHUTDOWN: u16 = 1001;

struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    force_close: Arc<Notify>,
}

/// Local, in-memory table of live WebSocket connections on this node.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new local connection. Returns the receiver the caller's
    /// egress task should forward to the WebSocket sink, and a `Notify` the
    /// egress task should race against that receiver: when it fires, the
    /// egress task must send a close frame and stop, bypassing whatever is
    /// still queued (used for backpressure overflow).
    pub fn register(&self, client_id: &str) -> (mpsc::Receiver<Message>, Arc<Notify>) {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let force_close = Arc::new(Notify::new());
        self.connections.insert(
            client_id.to_string(),
            ConnectionHandle {
                sender,
                force_close: force_close.clone(),
            },
        );
        (receiver, force_close)
    }

    pub fn unregister(&self, client_id: &str) {
        self.connections.remove(client_id);
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn local_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a JSON value to a specific local client. Returns `false` if the
    /// client isn't local to this node or its egress is gone; a full queue
    /// triggers an overflow close rather than blocking the caller.
    pub fn send_to_local_client(&self, client_id: &str, value: &Value) -> bool {
        let Some(conn) = self.connections.get(client_id) else {
            return false;
        };
        let text = value.to_string();
        match conn.sender.try_send(Message::Text(text.into())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(client_id, "send queue overflow, forcing close");
                conn.force_close.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Send a raw (already-serialized) text frame to a local client.
    pub fn send_text_to_local_client(&self, client_id: &str, text: String) -> bool {
        let Some(conn) = self.connections.get(client_id) else {
            return false;
        };
        match conn.sender.try_send(Message::Text(text.into())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                conn.force_close.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Broadcast to every local connection, optionally skipping one client.
    pub fn broadcast_local(&self, value: &Value, exclude_client_id: Option<&str>) {
        let text = value.to_string();
        for entry in self.connections.iter() {
            if Some(entry.key().as_str()) == exclude_client_id {
                continue;
            }
            if let Err(TrySendError::Full(_)) =
                entry.sender.try_send(Message::Text(text.clone().into()))
            {
                entry.force_close.notify_one();
            }
        }
    }

    /// Enqueue a close frame to every local connection (graceful shutdown).
    /// Unlike the overflow path this goes through the normal queue so any
    /// already-buffered messages are flushed first.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let senders: Vec<mpsc::Sender<Message>> = self
            .connections
            .iter()
            .map(|e| e.sender.clone())
            .collect();
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        for sender in senders {
            let _ = sender.send(frame.clone()).await;
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_client_returns_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_local_client("ghost", &serde_json::json!({"a":1})));
    }

    #[tokio::test]
    async fn registered_client_receives_message() {
        let registry = ConnectionRegistry::new();
        let (mut rx, _force_close) = registry.register("c1");

        assert!(registry.send_to_local_client("c1", &serde_json::json!({"hello": "world"})));

        let msg = rx.recv().await.unwrap();
        match msg {
            Message::Text(text) => assert!(text.contains("hello")),
            _ => panic!("expected text message"),
        }
    }

    #[tokio::test]
    async fn overflow_notifies_force_close() {
        let registry = ConnectionRegistry::new();
        let (_rx, force_close) = registry.register("c1");

        for _ in 0..SEND_QUEUE_CAPACITY {
            registry.send_to_local_client("c1", &serde_json::json!({}));
        }
        // One more should overflow the bounded channel and flip force_close.
        let sent = registry.send_to_local_client("c1", &serde_json::json!({}));
        assert!(!sent);

        // Should resolve immediately rather than hang.
        tokio::time::timeout(std::time::Duration::from_millis(100), force_close.notified())
            .await
            .expect("force_close should have fired");
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let registry = ConnectionRegistry::new();
        let (_rx, _fc) = registry.register("c1");
        assert!(registry.contains("c1"));
        registry.unregister("c1");
        assert!(!registry.contains("c1"));
    }
}
