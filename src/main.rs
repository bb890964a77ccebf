use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::http::{AppState, HttpServer};
use gatekeeper::ratelimit::{BackendRegistry, Sweeper, ViolationReporter};

/// Request admission control service.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }

    init_tracing(&config.logging);

    info!("Starting Gatekeeper Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = %config.rate_limiting.backend,
        policies = config.rate_limiting.policies.len(),
        "Configuration loaded"
    );

    // A backend without a registered implementation must stop startup
    let registry = BackendRegistry::new();
    let store = registry.build(&config.rate_limiting).map_err(|e| {
        error!(error = %e, "Refusing to start without a working counter backend");
        e
    })?;

    let sweeper = Sweeper::new(store.clone(), config.rate_limiting.sweep_interval()).spawn();

    let state = AppState::from_config(&config.rate_limiting, store, ViolationReporter::default())?;
    info!("Rate limiters initialized");

    let server = HttpServer::new(config.server.http_addr, state);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    sweeper.shutdown().await;
    served?;

    info!("Gatekeeper Admission Control Service stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
