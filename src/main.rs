//! uns-gateway - SOCKS5 over an acoustic modem link
//!
//! This is the main entry point for the gateway binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uns_gateway::config::load_config_or_default;
use uns_gateway::logging::{init_logging, LogLevel};
use uns_gateway::run_gateway;

/// uns-gateway - SOCKS5 proxy tunnelled over an AquaSent modem
#[derive(Parser, Debug)]
#[command(name = "uns-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (`key value` lines, or TOML for *.toml)
    #[arg(short, long, default_value = "uns.conf")]
    config: PathBuf,

    /// Log level overriding the configuration (error, warn, info, debug or 3-0)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Log file overriding the configuration
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, found) = load_config_or_default(&args.config)?;
    if let Some(level) = args.log_level {
        config.log.log_level = level;
    }
    if let Some(path) = args.log_file {
        config.log.log_file = path;
    }

    init_logging(&config.log.log_file, config.log.log_level)?;

    info!("{} v{}", uns_gateway::NAME, uns_gateway::VERSION);
    if found {
        info!("Configuration loaded from: {:?}", args.config);
    } else {
        warn!("Configuration file {:?} not found, using defaults", args.config);
    }
    info!(
        "Modem {} on {:?} at {} baud, mtu {}",
        config.modem.aquasent_name,
        config.modem.aquasent_port,
        config.modem.aquasent_baud,
        config.modem.aquasent_mtu
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!("Failed to install signal handlers: {}", e);
            // Keep the sender alive so the gateway keeps running.
            std::future::pending::<()>().await;
        }
        let _ = shutdown_tx.send(true);
    });

    run_gateway(config, shutdown_rx).await
}

/// Wait for SIGINT, SIGTERM or SIGABRT
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigabrt = signal(SignalKind::from_raw(libc::SIGABRT))?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigabrt.recv() => {
            info!("Received SIGABRT, shutting down...");
        }
    }
    Ok(())
}
