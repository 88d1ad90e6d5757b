//! The binary entry point for the SOE forwarder.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use forwarder_app::{Bridge, BridgeConfig, BridgeEvent};
use forwarder_config::{CliArgs, ConfigError, ForwarderConfig, default_config_dir};
use forwarder_soe::{UdpConfig, UdpListeners};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    // The logger is configured from the file, so the outcome of reading it is
    // reported once logging is up.
    let opened = ForwarderConfig::open(&config_dir);
    let mut config = match &opened {
        Ok((config, _)) => config.clone(),
        Err(_) => ForwarderConfig::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config.debug.log_dir.clone();
    if let Err(e) = forwarder_log::init_logging(log_dir.as_deref(), log_dir.is_some(), Some(&config))
    {
        eprintln!("Failed to initialize logging: {e}");
    }
    match opened {
        Ok((_, origin)) => tracing::info!("{origin}"),
        Err(e) => tracing::warn!("Using default settings: {e}"),
    }

    match run(&config, &config_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Forwarder stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &ForwarderConfig, config_dir: &Path) -> Result<(), AppError> {
    let network = &config.network;
    let listeners = UdpListeners::bind(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        network.login_port,
        network.zone_port,
        network.ping_port,
        &UdpConfig::default(),
    )
    .await?;

    let bridge = Bridge::start(listeners, BridgeConfig::from_config(config))?;
    tokio::spawn(log_events(bridge.subscribe()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for Ctrl-C: {e}");
    }

    let (username, password) = bridge.shutdown().await;
    ForwarderConfig::store_credentials(config_dir, &username, &password)?;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<BridgeEvent>) {
    loop {
        match events.recv().await {
            Ok(BridgeEvent::ClientConnected) => tracing::info!("Client connected"),
            Ok(BridgeEvent::ClientDisconnected) => tracing::info!("Client disconnected"),
            Ok(BridgeEvent::BackendConnected { address }) => {
                tracing::info!("Backend online at {address}");
            }
            Ok(BridgeEvent::BackendFailed { reason }) => {
                tracing::error!("Backend unavailable: {reason}");
            }
            Ok(event) => tracing::debug!("{event:?}"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Event log fell behind, skipped {missed} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
