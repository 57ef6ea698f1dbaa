//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, queue depth >= 1)
//! - Validate that the bind host is an IP address
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::IpAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.host {0:?} is not an IP address")]
    InvalidHost(String),

    #[error("listener.queue_depth must be at least 1")]
    ZeroQueueDepth,

    #[error("sniff.timeout_ms must be greater than 0")]
    ZeroSniffTimeout,

    #[error("shutdown.timeout_secs must be greater than 0")]
    ZeroShutdownTimeout,
}

/// Check a configuration, collecting every violation.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::InvalidHost(config.listener.host.clone()));
    }
    if config.listener.queue_depth == 0 {
        errors.push(ValidationError::ZeroQueueDepth);
    }
    if config.sniff.timeout_ms == 0 {
        errors.push(ValidationError::ZeroSniffTimeout);
    }
    if config.shutdown.timeout_secs == 0 {
        errors.push(ValidationError::ZeroShutdownTimeout);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
