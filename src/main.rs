#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! # rptmond
//!
//! Real-time AllStarLink/app_rpt node telemetry service.
//!
//! Connects to one or more Asterisk Manager Interface sessions, maintains a
//! merged view of node/link state and per-link keying history, and fans the
//! result out over a single `/ws` WebSocket endpoint.
//!
//! ## Subcommands
//!
//! - `rptmond serve` (default) — run the AMI/poller/WebSocket server

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rptmond::ami::connector::{AmiConnector, AmiConnectorConfig};
use rptmond::ami::textid::TextNodeRegistry;
use rptmond::auth::SharedSecretValidator;
use rptmond::collaborators::{AllowAllAdmin, EmptyNodeDirectory, FileNodeDirectory, NodeDirectory, NullLinkStatsStore, SubscriberValidator};
use rptmond::config::Config;
use rptmond::keying::KeyingTracker;
use rptmond::poller::{spawn_enhanced_poller, OnDemandTrigger};
use rptmond::state::StateManager;
use rptmond::ws::{ws_upgrade, WebSocketHub};

/// Real-time AllStarLink/app_rpt node telemetry service.
#[derive(Parser)]
#[command(name = "rptmond", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the AMI/poller/WebSocket server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => {
            let args: Vec<String> = std::env::args().collect();
            args.windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone())
        }
    };

    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("rptmond v{} starting", env!("CARGO_PKG_VERSION"));
    info!(nodes = ?config.ami.node_ids, "Local nodes configured");
    info!("Listening on {}", config.server.listen);

    if config.ami.password == "change-me" {
        warn!("Using default AMI password — set RPTMOND_AMI_PASSWORD or update config");
    }

    let directory: Arc<dyn NodeDirectory> = match &config.directory {
        Some(dc) => match FileNodeDirectory::load(std::path::Path::new(&dc.path)) {
            Ok(dir) => {
                info!(path = %dc.path, "Loaded node directory");
                Arc::new(dir)
            }
            Err(e) => {
                warn!(path = %dc.path, error = %e, "Failed to load node directory, continuing without enrichment");
                Arc::new(EmptyNodeDirectory)
            }
        },
        None => Arc::new(EmptyNodeDirectory),
    };

    let validator: Arc<dyn SubscriberValidator> = if config.auth.admin_token.is_empty() {
        warn!("No admin_token configured — every /ws connection is granted admin access");
        Arc::new(AllowAllAdmin)
    } else {
        Arc::new(SharedSecretValidator::new(
            config.auth.admin_token.clone(),
            config.auth.viewer_token.clone(),
        ))
    };

    let state = Arc::new(StateManager::new(
        config.hub.talker_log_max,
        config.hub.talker_log_ttl_ms,
        Arc::new(NullLinkStatsStore),
        directory,
    ));
    let keying = Arc::new(KeyingTracker::new(config.poll.unkey_delay_ms));
    let registry = Arc::new(TextNodeRegistry::new());

    let mut on_demand_triggers = Vec::new();
    let mut connector_tasks = Vec::new();
    let mut event_tasks = Vec::new();
    let mut poller_tasks = Vec::new();

    for &node in &config.ami.node_ids {
        let connector = AmiConnector::new(AmiConnectorConfig {
            host: config.ami.host.clone(),
            port: config.ami.port,
            user: config.ami.user.clone(),
            password: config.ami.password.clone(),
            events: config.ami.events,
            retry_min: std::time::Duration::from_millis(config.ami.retry_min_ms),
            retry_max: std::time::Duration::from_millis(config.ami.retry_max_ms),
        });

        connector_tasks.push(tokio::spawn(connector.clone().run()));

        let mut raw_rx = connector.subscribe_raw();
        let event_state = Arc::clone(&state);
        let event_keying = Arc::clone(&keying);
        let event_registry = Arc::clone(&registry);
        event_tasks.push(tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Ok(msg) => {
                        event_state.apply(node, &msg, &event_keying, &event_registry).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let trigger = Arc::new(OnDemandTrigger::new());
        on_demand_triggers.push(Arc::clone(&trigger));

        poller_tasks.push(tokio::spawn(spawn_enhanced_poller(
            node,
            std::time::Duration::from_millis(config.poll.interval_ms),
            connector,
            Arc::clone(&state),
            Arc::clone(&keying),
            Arc::clone(&registry),
            trigger,
        )));
    }

    let hub = WebSocketHub::new(
        Arc::clone(&state),
        Arc::clone(&keying),
        validator,
        on_demand_triggers,
        &config.hub,
    );

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(hub)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    for task in connector_tasks.into_iter().chain(event_tasks).chain(poller_tasks) {
        task.abort();
    }
    info!("Goodbye");
}

async fn healthz() -> &'static str {
    "ok"
}
