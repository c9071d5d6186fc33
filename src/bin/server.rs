//! Usage Registry server
//!
//! Runs the HTTP surface and the ingestion workers in one process.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use usage_registry::{metrics, App, RegistryConfig};

#[derive(Parser)]
#[command(name = "usage-registry")]
#[command(about = "Usage-aware GraphQL schema registry")]
struct Cli {
    /// Config file (defaults to usage.toml and the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Write the effective config to this file and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.as_ref().map(|p| p.display().to_string());
    let mut config =
        RegistryConfig::load_from(config_path.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    if let Some(path) = cli.dump_config {
        config
            .save(&path.display().to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        println!("📝 Config written to {}", path.display());
        return Ok(());
    }

    if config.tokens.is_empty() {
        tracing::warn!("no tokens configured, every authenticated request will be rejected");
    }

    metrics::init_metrics(&config.metrics).map_err(anyhow::Error::msg)?;

    let app = App::build(&config);
    let router = app.router();

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    tracing::info!(addr = %config.server.listen_addr, "usage registry listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("shutting down, draining usage queue");
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
