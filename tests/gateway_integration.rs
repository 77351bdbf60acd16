//! Cross-node scenarios driven through the public ingress/router surface,
//! using the in-memory KVPS double to simulate a small cluster without a
//! real Redis instance.

use std::sync::Arc;

use wsgateway::cluster::{ConnectionCounter, Node, NodeManager};
use wsgateway::kvps::{FakeBus, FakeKvps, Kvps};
use wsgateway::metrics::new_shared_collector;
use wsgateway::registry::ConnectionRegistry;
use wsgateway::router::MessageRouter;
use wsgateway::services::build_registry;

struct GatewayNode {
    node_manager: Arc<NodeManager>,
    router: Arc<MessageRouter>,
    registry: Arc<ConnectionRegistry>,
    services: wsgateway::services::ServiceRegistry,
}

fn spin_up(bus: &FakeBus, hostname: &str) -> GatewayNode {
    let (kvps, rx) = FakeKvps::connect(bus);
    let kvps: Arc<dyn Kvps> = Arc::new(kvps);
    let node_manager = Arc::new(NodeManager::new(
        Node::new(hostname),
        kvps.clone(),
        Arc::new(ConnectionCounter::default()),
        new_shared_collector(),
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(MessageRouter::new(node_manager.clone(), kvps, registry.clone()));
    tokio::spawn(router.clone().run_inbound_loop(rx));

    let (services, _sweepers) = build_registry(
        &["chat".to_string(), "presence".to_string(), "cursor".to_string(), "reaction".to_string()],
        router.clone(),
    );

    GatewayNode { node_manager, router, registry, services }
}

async fn connect(node: &GatewayNode, client_id: &str) -> tokio::sync::mpsc::Receiver<axum::extract::ws::Message> {
    let (rx, _force_close) = node.registry.register(client_id);
    node.router.register_local_client(client_id).await.unwrap();
    rx
}

fn text_of(msg: axum::extract::ws::Message) -> String {
    match msg {
        axum::extract::ws::Message::Text(t) => t.to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_join_and_send_fans_out_across_nodes() {
    let bus = FakeBus::new();
    let node_a = spin_up(&bus, "node-a");
    let node_b = spin_up(&bus, "node-b");

    let mut alice = connect(&node_a, "alice").await;
    let mut bob = connect(&node_b, "bob").await;

    let reply = wsgateway::ingress::dispatch(&node_a.services, "alice", r#"{"service":"chat","action":"join","channel":"lobby"}"#).await;
    assert_eq!(reply["success"], true);
    let reply = wsgateway::ingress::dispatch(&node_b.services, "bob", r#"{"service":"chat","action":"join","channel":"lobby"}"#).await;
    assert_eq!(reply["success"], true);

    let reply = wsgateway::ingress::dispatch(
        &node_a.services,
        "alice",
        r#"{"service":"chat","action":"send","channel":"lobby","message":"hi everyone"}"#,
    )
    .await;
    assert_eq!(reply["success"], true);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // alice sees her own join ack/history replay plus the broadcast message.
    let mut saw_message_alice = false;
    while let Ok(msg) = alice.try_recv() {
        if text_of(msg).contains("hi everyone") {
            saw_message_alice = true;
        }
    }
    assert!(saw_message_alice, "sender should see its own channel message");

    let mut saw_message_bob = false;
    while let Ok(msg) = bob.try_recv() {
        if text_of(msg).contains("hi everyone") {
            saw_message_bob = true;
        }
    }
    assert!(saw_message_bob, "remote node's subscriber should receive the fan-out");
}

#[tokio::test]
async fn channel_message_only_targets_subscribed_nodes() {
    let bus = FakeBus::new();
    let node_a = spin_up(&bus, "node-a");
    let node_b = spin_up(&bus, "node-b");
    let node_c = spin_up(&bus, "node-c");

    connect(&node_b, "bob").await;
    wsgateway::ingress::dispatch(&node_b.services, "bob", r#"{"service":"chat","action":"join","channel":"lobby"}"#).await;

    wsgateway::ingress::dispatch(
        &node_a.services,
        "alice",
        r#"{"service":"chat","action":"send","channel":"lobby","message":"hello"}"#,
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let targets = node_a.node_manager.get_nodes_for_channel("lobby").await.unwrap();
    assert!(targets.contains(&node_b.node_manager.id().to_string()));
    assert!(!targets.contains(&node_c.node_manager.id().to_string()));
}

#[tokio::test]
async fn standalone_node_still_serves_local_clients() {
    let kvps: Arc<dyn Kvps> = Arc::new(wsgateway::kvps::StandaloneKvps);

    let node = Arc::new(NodeManager::new(
        Node::new("solo"),
        kvps.clone(),
        Arc::new(ConnectionCounter::default()),
        new_shared_collector(),
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(MessageRouter::new(node.clone(), kvps, registry.clone()));
    assert!(router.node_id().starts_with("solo-"));
    assert!(node.is_standalone());

    let (services, _sweepers) = build_registry(&["reaction".to_string()], router.clone());

    let (mut rx_alice, _fc) = registry.register("alice");
    router.register_local_client("alice").await.unwrap();
    wsgateway::ingress::dispatch(&services, "alice", r#"{"service":"reaction","action":"subscribe","channel":"party"}"#).await;

    wsgateway::ingress::dispatch(
        &services,
        "alice",
        r#"{"service":"reaction","action":"send","channel":"party","emoji":"🎉"}"#,
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let mut saw_reaction = false;
    while let Ok(msg) = rx_alice.try_recv() {
        if text_of(msg).contains("confetti") {
            saw_reaction = true;
        }
    }
    assert!(saw_reaction, "standalone node should still fan out to its own local subscribers");
}

#[tokio::test]
async fn graceful_shutdown_unwinds_the_directory() {
    let bus = FakeBus::new();
    let node_a = spin_up(&bus, "node-a");

    connect(&node_a, "alice").await;
    wsgateway::ingress::dispatch(&node_a.services, "alice", r#"{"service":"chat","action":"join","channel":"lobby"}"#).await;
    node_a.node_manager.register().await.unwrap();

    node_a.registry.close_all(1001, "server shutting down").await;
    assert_eq!(node_a.registry.local_count(), 0);

    node_a.node_manager.shutdown().await;
    let info = node_a.node_manager.get_cluster_info().await.unwrap();
    assert!(info.nodes.is_empty());
    assert!(node_a.node_manager.get_nodes_for_channel("lobby").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_service_request_gets_an_error_frame_not_a_dropped_connection() {
    let bus = FakeBus::new();
    let node_a = spin_up(&bus, "node-a");
    connect(&node_a, "alice").await;

    let reply = wsgateway::ingress::dispatch(&node_a.services, "alice", r#"{"service":"telemetry","action":"ping"}"#).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["success"], false);
}
