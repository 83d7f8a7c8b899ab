//! Process-wide logging setup for the binary.
//!
//! Library code logs through the `log` macros; those records are forwarded
//! into `tracing` so that they share one subscriber with the sweep spans.

use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

pub const DEFAULT_FILTER: &str = "info,jobsync=debug";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to install log bridge: {0}")]
    LogBridge(#[from] log::SetLoggerError),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Filter used when `RUST_LOG` is unset: the configured directives, else
/// [`DEFAULT_FILTER`].
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber. Call once, before any worker starts.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    LogTracer::init()?;

    let filter = env_filter(config);

    if config.json {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_names(true),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        json_format = config.json,
        "Logging initialized"
    );
    Ok(())
}
