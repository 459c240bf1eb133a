//! uplinkd: remote device-management daemon.
//!
//! Connects to the cloud control channel and keeps it up until SIGINT or
//! SIGTERM.

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uplinkd::config::{CliOverrides, Config};
use uplinkd::context::DaemonContext;
use uplinkd::params::Params;
use uplinkd::pin::AccessControl;
use uplinkd::signal::Signal;
use uplinkd::supervisor;

/// uplinkd: remote device-management daemon
#[derive(Parser, Debug)]
#[command(name = "uplinkd", version, about = "Remote device-management daemon")]
struct Cli {
    /// Cloud endpoint (ws:// or wss://)
    #[arg(long, env = "UPLINK_HOST")]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.uplink/config.toml")]
    config: String,

    /// Parameter store directory
    #[arg(long)]
    params_dir: Option<String>,

    /// Number of RPC workers
    #[arg(long, env = "UPLINK_RPC_WORKERS")]
    rpc_workers: Option<usize>,

    /// Clear the remote access PIN and exit
    #[arg(long)]
    reset_pin: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Both tokio-tungstenite and reqwest go through rustls.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let overrides = CliOverrides {
        host: cli.host.clone(),
        params_dir: cli.params_dir.clone(),
        rpc_workers: cli.rpc_workers,
    };
    let config = Config::load(Some(&PathBuf::from(&cli.config)), &overrides)
        .context("failed to load config")?;

    if cli.reset_pin {
        let params = Params::open(&config.params_dir).context("failed to open params")?;
        AccessControl::new(params)
            .clear(true, None)
            .context("failed to clear PIN")?;
        info!("remote access PIN cleared");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        "starting uplinkd"
    );

    let ctx = Arc::new(DaemonContext::new(config).context("failed to initialize")?);
    let exit = Signal::new();
    let supervisor = tokio::spawn(supervisor::run(ctx, exit.clone()));

    shutdown_signal().await;
    info!("received shutdown signal");
    exit.set();

    match supervisor.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "supervisor error"),
        Err(e) => error!(error = %e, "supervisor task failed"),
    }

    info!("uplinkd stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
