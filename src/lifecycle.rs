//! Graceful shutdown. `shutdown_signal` is what `main` races the listener
//! against; once it resolves, `shutdown` drains connections and unwinds the
//! node directory in order before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::NodeManager;
use crate::registry::{ConnectionRegistry, CLOSE_CODE_SHUTDOWN};
use crate::services::ServiceSweepers;

/// Upper bound on how long shutdown waits for in-flight sends to drain
/// before moving on regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolves on SIGINT (all platforms) or SIGTERM (unix). Used as the future
/// `axum::serve`'s `with_graceful_shutdown` races the listener against.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Graceful teardown once the listener has stopped accepting new
/// connections: close every local client with code 1001, stop the
/// presence/cursor sweepers, then unwind this node's directory entries.
pub async fn shutdown(
    registry: &Arc<ConnectionRegistry>,
    node_manager: &Arc<NodeManager>,
    sweepers: &ServiceSweepers,
) {
    info!("closing local connections");
    tokio::time::timeout(
        SHUTDOWN_GRACE,
        registry.close_all(CLOSE_CODE_SHUTDOWN, "server shutting down"),
    )
    .await
    .unwrap_or_else(|_| warn!("connection drain exceeded grace period, closing anyway"));

    let _ = sweepers.presence_shutdown.send(true);
    let _ = sweepers.cursor_shutdown.send(true);

    info!(node_id = %node_manager.id(), "unwinding node directory entries");
    node_manager.shutdown().await;
}
