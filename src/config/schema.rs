//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::signals::ShutdownSignal;

/// Root configuration for a twinport server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (host, RPC and gateway ports).
    pub listener: ListenerConfig,

    /// Protocol sniffing settings for the shared port.
    pub sniff: SniffConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind both ports on (e.g., "0.0.0.0").
    pub host: String,

    /// Port for the gRPC server. `0` picks an ephemeral port.
    pub rpc_port: u16,

    /// Port for the HTTP/JSON gateway.
    ///
    /// `None` (or the same non-zero port as `rpc_port`) shares the RPC
    /// socket through the multiplexer. `Some(0)` asks for a separate
    /// ephemeral socket.
    pub gateway_port: Option<u16>,

    /// Depth of the hand-off queue between the shared accept loop and
    /// each logical listener.
    pub queue_depth: usize,
}

impl ListenerConfig {
    /// Whether both protocols are served from one physical socket.
    pub fn is_multiplexed(&self) -> bool {
        match self.gateway_port {
            None => true,
            Some(port) => port == self.rpc_port && port != 0,
        }
    }

    /// Address the RPC (or shared) socket binds to.
    pub fn rpc_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.rpc_port))
    }

    /// Address the gateway socket binds to when not multiplexed.
    pub fn gateway_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.gateway_port.unwrap_or(self.rpc_port)))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            rpc_port: 7000,
            gateway_port: None,
            queue_depth: 1,
        }
    }
}

/// What to do with a connection that sends nothing classifiable in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffPolicy {
    /// Hand the connection to the HTTP gateway.
    #[default]
    FailOpen,
    /// Close the connection.
    FailClosed,
}

/// Protocol sniffing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SniffConfig {
    /// Read window for classifying a new connection, in milliseconds.
    pub timeout_ms: u64,

    /// Policy for connections that stay silent past the window.
    pub policy: SniffPolicy,
}

impl SniffConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            policy: SniffPolicy::FailOpen,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Default deadline for the whole shutdown sequence, in seconds.
    pub timeout_secs: u64,

    /// OS signals that trigger the shutdown sequence.
    pub signals: Vec<ShutdownSignal>,
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            signals: vec![ShutdownSignal::Interrupt, ShutdownSignal::Terminate],
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}
