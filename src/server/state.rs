//! Shared axum state: a handful of `Arc`s the handlers read from, never own.

use std::sync::Arc;

use crate::cluster::NodeManager;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::services::ServiceRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node_manager: Arc<NodeManager>,
    pub router: Arc<MessageRouter>,
    pub registry: Arc<ConnectionRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub enabled_services: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        node_manager: Arc<NodeManager>,
        router: Arc<MessageRouter>,
        registry: Arc<ConnectionRegistry>,
        services: ServiceRegistry,
        enabled_services: Vec<String>,
    ) -> Self {
        Self {
            node_manager,
            router,
            registry,
            services: Arc::new(services),
            enabled_services: Arc::new(enabled_services),
        }
    }
}
