//! Homelink - pairing and realtime coordinator for home-automation companions
//!
//! Companion devices pair against a short-lived PIN, receive an opaque trust
//! token, and then authenticate REST calls and a persistent WebSocket channel
//! with it.

use anyhow::Result;
use clap::Parser;
use homelink_core::Config;
use homelink_server::{create_router, AppState, ServiceCommand};
use homelink_store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Homelink - pair companion devices with your home-automation coordinator
#[derive(Parser, Debug)]
#[command(name = "homelink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8130")]
    port: u16,

    /// Path to the SQLite database (default: ~/.config/homelink/homelink.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Pairing PIN validity in seconds
    #[arg(long, default_value = "300")]
    pin_ttl: i64,

    /// Seconds between pairing-session sweeps
    #[arg(long, default_value = "60")]
    sweep_interval: u64,

    /// Seconds between realtime heartbeat pings
    #[arg(long, default_value = "30")]
    heartbeat_interval: u64,

    /// Bearer token for client-management endpoints
    /// When unset, those endpoints stay closed
    #[arg(long, env = "HOMELINK_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("Homelink v{}", env!("CARGO_PKG_VERSION"));

    let db_path = match args.db {
        Some(path) => path,
        None => Store::default_path()?,
    };

    let mut config = Config::new()
        .with_port(args.port)
        .with_db_path(db_path.clone())
        .with_pin_ttl_secs(args.pin_ttl)
        .with_sweep_interval_secs(args.sweep_interval)
        .with_heartbeat_interval_secs(args.heartbeat_interval);
    if let Some(token) = args.admin_token {
        config = config.with_admin_token(token);
    }

    if config.admin_token.is_none() {
        warn!("No admin token configured; client-management endpoints are disabled");
    }

    let store = Arc::new(Store::open(&db_path)?);

    // Upstream service-call sink. The coordinator integration consumes this
    // channel; until one is attached, calls are drained and logged.
    let (command_tx, mut command_rx) = mpsc::channel::<ServiceCommand>(64);
    let sink = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            info!(
                "Service call from {}: {}.{}",
                command.client_id, command.call.domain, command.call.service
            );
        }
    });

    let state = Arc::new(AppState::new(config.clone(), store.clone(), command_tx));
    state.sessions.start_sweeper();

    // First-run convenience: surface a pairing PIN right away
    if store.client_count().await? == 0 {
        let issued = state.sessions.generate_pin().await?;
        info!("");
        info!("  No paired clients yet. Pairing PIN: {}", issued.pin);
        info!("  Expires in {} seconds", issued.expires_in);
        info!("");
    }

    let router = create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    state.sessions.stop();
    sink.abort();

    info!("Goodbye!");
    Ok(())
}
