//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Trigger (explicit call or signal) → NotStarted → ShuttingDown
//!     → all handlers concurrently, one shared deadline
//!     → collect every failure → Done → wake await_termination()
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT (configurable set) → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - The shutdown sequence runs at most once per manager
//! - Shutdown has timeout: handlers still running at the deadline are
//!   reported, not awaited
//! - No process-wide default manager; whoever runs the server owns one

pub mod shutdown;
pub mod signals;

pub use shutdown::{
    FailureKind, HandlerFailure, Phase, RegisterError, ShutdownContext, ShutdownError,
    ShutdownHandler, ShutdownManager,
};
pub use signals::{ShutdownSignal, SignalListener};
