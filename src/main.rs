use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ssrproxy::proxy::{self, ProxyState};
use ssrproxy::{Coordinator, ProxyConfig};

/// Reverse proxy that injects browser-rendered HTML and Open Graph metadata
#[derive(Debug, Parser)]
#[command(name = "ssrproxy", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overrides `proxy_address`
    #[arg(long)]
    listen: Option<String>,

    /// Default log level; `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn init_logging(level: LevelFilter) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // also installs the `log` bridge the library logs through
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .context("failed to install log subscriber")
}

#[cfg(feature = "cdp")]
async fn start_coordinator(config: &ProxyConfig) -> Result<Coordinator> {
    let engine_config = config.engine_config();
    Coordinator::start(
        move || ssrproxy::new_engine(engine_config),
        config.site_profile(),
        config.coordinator_options(),
    )
    .await
    .context("failed to start render worker")
}

#[cfg(not(feature = "cdp"))]
async fn start_coordinator(_config: &ProxyConfig) -> Result<Coordinator> {
    anyhow::bail!("built without a browser backend; enable the `cdp` feature")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let config = ProxyConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let address = cli.listen.unwrap_or_else(|| config.proxy_address.clone());

    let coordinator = Arc::new(start_coordinator(&config).await?);
    let state = ProxyState::new(
        Arc::clone(&coordinator),
        config.route_table(),
        config.backend_url()?,
    )?;

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    proxy::serve(listener, state, shutdown_signal()).await?;

    // in-flight renders hold clones until they publish
    match Arc::try_unwrap(coordinator) {
        Ok(mut coordinator) => coordinator.shutdown().await?,
        Err(_) => log::warn!("Renders still in flight; exiting without joining the worker"),
    }
    Ok(())
}
