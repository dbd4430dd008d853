//! Structured logging setup

use crate::config::LoggingConfig;
use crate::error::{NotificationError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true).with_thread_ids(true));

            tracing::subscriber::set_global_default(subscriber).map_err(|e| {
                NotificationError::config(format!("Failed to set tracing subscriber: {}", e))
            })?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true).with_thread_ids(true));

            tracing::subscriber::set_global_default(subscriber).map_err(|e| {
                NotificationError::config(format!("Failed to set tracing subscriber: {}", e))
            })?;
        }
    }

    Ok(())
}
