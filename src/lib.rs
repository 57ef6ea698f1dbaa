//! gRPC and HTTP/JSON gateway hosting on one port, with coordinated
//! graceful shutdown.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod transport;

/// Boxed error crossing trait boundaries (handlers, registration).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::schema::ServerConfig;
pub use lifecycle::ShutdownManager;
pub use server::{Server, ServerError};
pub use transport::{CompoundServiceDesc, ServiceDesc, ServiceDescriptor};
