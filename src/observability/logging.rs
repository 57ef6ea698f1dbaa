//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the process-wide tracing subscriber (binaries only)
//! - Configure log level from config, overridable through `RUST_LOG`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Library types take an explicit `tracing::Span` instead of relying on
//!   whatever subscriber happens to be global

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber described by `config`.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("twinport={0},{0}", config.log_level)));

    let json = config.json.then(|| fmt::layer().json());
    let text = (!config.json).then(|| fmt::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
}
