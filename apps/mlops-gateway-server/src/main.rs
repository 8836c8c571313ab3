use std::path::PathBuf;

use anyhow::{Context, Result};
use api_gateway::{ApiGateway, GatewayConfig};
use api_gateway::config::LoggingConfig;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Authorizing reverse proxy for the MLOps platform.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// YAML configuration file. Defaults to `API_GATEWAY_CONFIG_PATH`, then
    /// `config/api-gateway.yaml`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration (secrets redacted) and exit.
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let json = logging
        .json
        .then(|| fmt::layer().json().flatten_event(true).with_target(true));
    let human = (!logging.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(human)
        .init();
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref())?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(&config.logging);
    tracing::info!(
        bind = %config.bind_addr(),
        jwks_uri = %config.entra_id.jwks_uri(),
        upstreams = config.upstreams.len(),
        "Starting MLOps API gateway"
    );

    let gateway = ApiGateway::bootstrap(config)
        .await
        .context("gateway startup failed")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    gateway.serve(cancel).await?;
    tracing::info!("Gateway stopped");
    Ok(())
}
