//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! Server::start(desc)
//!     → ListenerSet::bind            (fatal: ServerError::Bind)
//!     → desc.configurable().apply    (server interceptors)
//!     → register_rpc, register_gateway, docs routes
//!                                    (fatal: Registration / Document)
//!     → spawn serve loops: mux accept, tonic, axum
//!     → wait: all loops done after stop, or first real failure
//!
//! Server::stop(deadline)
//!     → graceful stop of tonic and axum, mux closed
//!     → loops still running at the deadline are aborted
//! ```
//!
//! # Design Decisions
//! - Registration always completes before the first connection is served
//! - A closed multiplexer or socket after stop is not a failure

pub mod error;
pub mod runtime;

pub use error::{is_expected_close, ServerError};
pub use runtime::{BoundAddrs, Server, ServerState};
