//! pkg-relay server
//!
//! Loads configuration, sets up logging, and runs the caching proxy until
//! SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use pkg_relay::{MetricsEndpoint, ProxyConfig, ProxyContext, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Caching proxy for package-manager HTTP traffic
#[derive(Debug, Parser)]
#[command(name = "pkg-relay", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "pkg-relay.yaml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Loading configuration from: {}", args.config.display());
    let mut config = ProxyConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache directory: {}", config.cache_dir.display());
    info!("  - Repositories: {}", config.repositories.len());
    info!("  - Max connections: {}", config.max_connections);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .thread_keep_alive(Duration::from_secs(config.thread_keep_alive_secs))
        .thread_name("pkg-relay")
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let ctx = ProxyContext::new(config).context("initializing proxy")?;

    if let Some(endpoint) = ctx.config.metrics_endpoint.clone().filter(|m| m.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
        let metrics = MetricsEndpoint::bind(Arc::clone(&ctx), addr)
            .await
            .context("binding metrics endpoint")?;
        tokio::spawn(async move {
            if let Err(e) = metrics.run().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let server = ProxyServer::bind(Arc::clone(&ctx)).await?;
    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_ctx.trigger_shutdown();
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
