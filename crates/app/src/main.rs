mod customers;
mod problem;
mod router;
mod server;
mod service;
mod telemetry;

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use customer_svc_storage::Database;
use customer_svc_util::{load_env_file, AppConfig, LoadOptions};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "customer-svc")]
#[command(about = "HTTP/JSON service for customer records")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    load_env_file();
    let config = AppConfig::load(LoadOptions {
        config_path: cli.config,
    })?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url, config.database_max_connections).await?;
    database.run_migrations().await?;
    info!(stage = "storage", max_connections = config.database_max_connections, "database ready");

    let state = router::AppState::new(metrics, database.clone());

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    server::serve(
        listener,
        router::app_router(state, config.request_timeout),
        shutdown_signal(),
        config.shutdown_timeout,
    )
    .await?;

    database.close().await;
    info!(stage = "app", "server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(stage = "app", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(stage = "app", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(stage = "app", "shutdown signal received");
}
