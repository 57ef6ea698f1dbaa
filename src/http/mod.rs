//! HTTP gateway subsystem.
//!
//! # Data Flow
//! ```text
//! gateway LogicalListener
//!     → axum::serve (HTTP/1.1 and h2c)
//!     → TraceLayer
//!     → GatewayMux routes (gateway.rs), registered by descriptors
//!     → docs routes (docs.rs): /swagger.json, /docs
//!     → base router fallback, if one was given
//! ```

pub mod docs;
pub mod gateway;

pub use docs::register_docs;
pub use gateway::{GatewayError, GatewayMux};
