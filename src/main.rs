//! Relay Gateway Server
//!
//! Loads configuration, wires the shared components together and serves
//! WebSocket clients until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_gateway::{
    functions::register_builtins,
    network::Fanout,
    BackendClient, Dispatcher, HealthReporter, HealthStatus, MemoryBackend, ObjectRegistry,
    RelayConfig, RelayServer, RoomManager, RpcRouter, ServerConfig, SessionRegistry, VERSION,
};

/// How often the health monitor logs a report.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayConfig::load(args.config.as_deref()).context("loading configuration")?;

    init_tracing(&config.log.level);

    info!("Relay Gateway v{}", VERSION);
    info!(
        addr = %config.server.bind_addr,
        path = %config.websocket.path,
        max_connections = config.server.max_connections,
        "configuration loaded"
    );

    // Backend
    let memory = Arc::new(MemoryBackend::new(config.backend.tokens()));
    let backend = BackendClient::new(memory, config.backend.timeouts());

    // Shared state
    let sessions = Arc::new(SessionRegistry::new());
    let objects = Arc::new(ObjectRegistry::new());
    let rooms = Arc::new(RoomManager::new(Some(backend.clone())));
    let rpc = Arc::new(RpcRouter::new());
    register_builtins(&rpc, rooms.clone(), Fanout::new(sessions.clone(), objects.clone())).await;
    info!(functions = ?rpc.function_names().await, "server functions registered");

    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        rooms,
        objects,
        rpc,
        backend.clone(),
    ));

    let server = RelayServer::bind(ServerConfig::from(&config), dispatcher)
        .await
        .context("binding listener")?;
    let shutdown = server.shutdown_token();

    tokio::spawn(monitor_health(
        HealthReporter::new(backend, sessions),
        shutdown.clone(),
    ));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    info!("relay gateway stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    #[cfg(feature = "debug-tracing")]
    let level = {
        let _ = level;
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log a health report periodically until shutdown.
async fn monitor_health(reporter: HealthReporter, shutdown: tokio_util::sync::CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = reporter.detailed();
                match report.status {
                    HealthStatus::Healthy => info!(
                        connections = report.connections,
                        backend = ?report.backend,
                        "health check"
                    ),
                    HealthStatus::Degraded => warn!(
                        connections = report.connections,
                        backend = ?report.backend,
                        "backend not ready, serving degraded"
                    ),
                }
            }
        }
    }
}
