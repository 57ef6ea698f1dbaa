//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! rpc_port == gateway_port:
//!     one TcpListener
//!     → mux.rs (accept loop, per-connection sniffing task)
//!     → bounded queue per role
//!     → listener.rs LogicalListener (Rpc) / LogicalListener (Gateway)
//!
//! rpc_port != gateway_port:
//!     two TcpListeners → one LogicalListener each, no sniffing
//!
//! Either way:
//!     → connection.rs PeekedStream (replays sniffed bytes)
//!     → tonic (Rpc) / axum (Gateway)
//! ```
//!
//! # Design Decisions
//! - Bind failures surface from `ListenerSet::bind`, never on first accept
//! - Bounded hand-off queues; the accept loop itself never blocks on them
//! - A closed multiplexer is a normal shutdown outcome, not a failure

pub mod connection;
pub mod listener;
pub mod mux;

pub use connection::{ConnectionId, PeekedStream};
pub use listener::{ListenerSet, LogicalListener, NetError};
pub use mux::{classify, Acceptor, Classification, Multiplexer, MuxCloser, Role, HTTP2_PREFACE};
