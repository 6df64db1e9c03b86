use anyhow::{Context, Result};
use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use burrow_shared::config::Config;

mod ingress;
mod manager;
mod metrics;
mod sse;
mod tcp;
mod tunnel;
mod ws;

use ingress::AppState;
use manager::Manager;
use metrics::Metrics;

#[derive(Parser)]
#[command(name = "burrow-server")]
#[command(about = "Public server for the burrow reverse tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the server configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("BURROW_SERVER_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./configs/server.yaml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    config
        .validate_server()
        .context("invalid server configuration")?;

    init_tracing(&config);
    info!(
        "{} v{} starting ({})",
        config.app.name, config.app.version, config.app.env
    );

    let manager = Arc::new(Manager::new());
    manager.clone().start_heartbeat();

    let state = AppState {
        manager,
        metrics: Metrics::new(),
        private_use: config.tunnel_server.private_use,
    };

    let mut router = Router::new()
        .route("/ws", get(ingress::control_handler))
        .route("/health", get(ingress::health))
        .route("/metrics", get(ingress::metrics_handler));

    if config.tunnel_server.private_use {
        info!("private-use mode: requests route to the first available tunnel");
    } else {
        router = router.route(
            "/tunnel/{tunnel_id}/{*path}",
            any(ingress::prefixed_proxy_handler),
        );
        info!("multi-tunnel mode: explicit routing under /tunnel/{{tunnel_id}}/");
    }

    let app = router
        .fallback(ingress::default_proxy_handler)
        .with_state(state.clone());

    if config.tunnel_server.tcp_port > 0 {
        tokio::spawn(tcp::run_tcp_ingress(config.tunnel_server.tcp_port, state));
    } else {
        info!("tcp ingress disabled; set tunnel_server.tcp_port to enable it");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.tunnel_server.port));
    info!("tunnel server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = if config.app.is_production() { "info" } else { "debug" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}
