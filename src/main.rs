use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wsgateway::cli::{Cli, Commands};
use wsgateway::cluster::{ConnectionCounter, Node, NodeManager};
use wsgateway::config::Config;
use wsgateway::kvps::{Kvps, MessageReceiver, RedisKvps, StandaloneKvps};
use wsgateway::lifecycle;
use wsgateway::metrics::new_shared_collector;
use wsgateway::registry::ConnectionRegistry;
use wsgateway::router::MessageRouter;
use wsgateway::server::{create_router, AppState};
use wsgateway::services::build_registry;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Commands::Serve(args) = cli.command;

    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            eprintln!("failed to load env file {}: {e}", env_file.display());
            process::exit(1);
        }
    }

    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(c) => c.with_overrides(args.port, args.node_name, args.kvps_url, args.enabled_services),
        Err(e) => {
            error!("invalid configuration: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let hostname = config.node_name.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "wsgateway".to_string())
    });
    let node = Node::new(hostname);

    let (kvps, inbound_rx): (Arc<dyn Kvps>, Option<MessageReceiver>) = match &config.kvps_url {
        Some(url) => match RedisKvps::connect(url).await {
            Ok((client, rx)) => (Arc::new(client), Some(rx)),
            Err(e) => {
                warn!(error = %e, "failed to reach KVPS backend, falling back to standalone");
                (Arc::new(StandaloneKvps), None)
            }
        },
        None => {
            info!("no KVPS_URL configured, running standalone");
            (Arc::new(StandaloneKvps), None)
        }
    };

    let connections = Arc::new(ConnectionCounter::default());
    let metrics = new_shared_collector();
    let node_manager = Arc::new(NodeManager::new(node, kvps.clone(), connections, metrics));
    node_manager.register().await?;

    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(MessageRouter::new(node_manager.clone(), kvps, registry.clone()));

    if let Some(rx) = inbound_rx {
        tokio::spawn(router.clone().run_inbound_loop(rx));
    }

    let (services, sweepers) = build_registry(&config.enabled_services, router.clone());
    let state = AppState::new(
        node_manager.clone(),
        router.clone(),
        registry.clone(),
        services,
        config.enabled_services.clone(),
    );

    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        node_id = %node_manager.id(),
        %addr,
        standalone = node_manager.is_standalone(),
        "gateway listening"
    );
    info!("  GET  /health  - liveness");
    info!("  GET  /cluster - cluster directory snapshot");
    info!("  GET  /stats   - local connection + service counters");
    info!("  GET  /ws      - client WebSocket upgrade");

    axum::serve(listener, app)
        .with_graceful_shutdown(lifecycle::shutdown_signal())
        .await?;

    lifecycle::shutdown(&registry, &node_manager, &sweepers).await;

    Ok(())
}
