//! # Gateway Admission - Main Entry Point
//!
//! Loads configuration, installs logging, builds the admission controller and
//! serves the admin API until SIGTERM or SIGINT.
//!
//! Configuration is read from `GATEWAY_CONFIG_PATH` (default
//! `config/gateway.yaml`); `GATEWAY_*` environment variables override it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use gateway_admission::admin::{AdminRouter, AdminState};
use gateway_admission::discovery::ServiceChangeReceiver;
use gateway_admission::observability::init_logging;
use gateway_admission::{GatewayAdmissionController, GatewayConfig};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_logging(&config.logging)?;

    info!("Starting gateway admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "Configuration loaded and validated");

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.admin_port)
        .parse()
        .context("Invalid admin bind address")?;

    let controller = match GatewayAdmissionController::new(config) {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            error!("Failed to initialize admission controller: {}", e);
            return Err(e.into());
        }
    };

    info!(
        services = controller.get_all_services().len(),
        api_keys = controller.list_api_keys().len(),
        "Admission controller ready"
    );

    tokio::spawn(log_service_changes(controller.subscribe_to_service_changes()));

    AdminRouter::serve(AdminState::new(controller), admin_addr, shutdown_signal()).await?;

    info!("Gateway admission service shutdown complete");
    Ok(())
}

/// Log registry changes made through the admin API
async fn log_service_changes(mut changes: ServiceChangeReceiver) {
    loop {
        match changes.recv().await {
            Ok(event) => info!(event = ?event, "Service registry changed"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Service change log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
