//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events inside the span handed to Server / ShutdownManager
//!     → metrics.rs (counters)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, text or JSON)
//!     → whatever metrics recorder the application installs
//! ```

pub mod logging;
pub mod metrics;
