//! # Structured Logging
//!
//! Subscriber setup for the gateway binary. `RUST_LOG` wins when set; otherwise
//! the configured level applies to this crate and `tower_http`, with everything
//! else at `warn`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// Filter used when `RUST_LOG` is unset
pub fn default_directives(level: &str) -> String {
    format!("warn,gateway_admission={level},tower_http={level}", level = level)
}

/// Build the env filter for `config`
pub fn build_filter(config: &LoggingConfig) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directives(&config.level))
            .map_err(|e| GatewayError::config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Install the global subscriber
///
/// Calling this twice is harmless; the second call logs a warning and keeps
/// the subscriber already installed.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if installed.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
    Ok(())
}
