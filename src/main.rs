use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatehouse::config::GatehouseConfig;
use gatehouse::executor::SimulatedExecutor;
use gatehouse::http::{AppState, HttpServer};
use gatehouse::provider::CommandQueueProvider;
use gatehouse::queue::QueueStrategy;
use gatehouse::tasks::{spawn_promoter, spawn_sweeper};

/// Admission control and request queueing service.
#[derive(Debug, Parser)]
#[command(name = "gatehouse", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Queue strategy
    #[arg(long, value_enum)]
    strategy: Option<QueueStrategy>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Gatehouse");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatehouseConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.server.http_addr = addr;
    }
    if let Some(strategy) = cli.strategy {
        config.queue.strategy = strategy;
    }
    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        strategy = ?config.queue.strategy,
        max_capacity = config.queue.max_capacity,
        max_requests = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window_secs,
        "Configuration loaded"
    );

    let provider = Arc::new(CommandQueueProvider::from_config(&config));
    let executor = Arc::new(SimulatedExecutor::new(&config.executor));

    let cancel = CancellationToken::new();
    let promoter = spawn_promoter(
        provider.clone(),
        config.workers.empty_queue_delay(),
        cancel.clone(),
    );
    let sweeper = spawn_sweeper(
        provider.clone(),
        config.workers.cleanup_interval(),
        cancel.clone(),
    );

    let server = HttpServer::new(
        config.server.http_addr,
        AppState::new(provider.clone(), executor),
    );
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    cancel.cancel();
    provider.close();
    let _ = tokio::join!(promoter, sweeper);

    served?;
    info!("Gatehouse stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
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
