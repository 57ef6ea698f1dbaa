//! Physical sockets and the logical listeners built on them.
//!
//! # Responsibilities
//! - Bind one socket per distinct address (fatal on failure)
//! - Route through the multiplexer when RPC and gateway share a port
//! - Present both cases to the servers as the same listener type

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::{ListenerConfig, SniffConfig};
use crate::net::connection::PeekedStream;
use crate::net::mux::{AcceptFailure, Accepted, Multiplexer, Role, EXHAUSTED_BACKOFF};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    BindAddr {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to inspect a bound socket.
    #[error("Failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    /// The multiplexer feeding this listener was shut down.
    #[error("mux: server closed")]
    MuxClosed,
}

enum Source {
    Socket(TcpListener),
    Queue(mpsc::Receiver<Accepted>),
}

/// A listener serving exactly one protocol role.
///
/// Either owns its own socket or drains the multiplexer's queue for its
/// role; servers cannot tell the difference.
pub struct LogicalListener {
    role: Role,
    local_addr: SocketAddr,
    source: Source,
}

impl LogicalListener {
    pub(crate) fn socket(role: Role, listener: TcpListener) -> Result<Self, NetError> {
        let local_addr = listener.local_addr().map_err(NetError::Bind)?;
        Ok(Self {
            role,
            local_addr,
            source: Source::Socket(listener),
        })
    }

    pub(crate) fn queued(role: Role, local_addr: SocketAddr, rx: mpsc::Receiver<Accepted>) -> Self {
        Self {
            role,
            local_addr,
            source: Source::Queue(rx),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether connections arrive through the multiplexer.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self.source, Source::Queue(_))
    }

    /// Wait for the next connection of this role.
    pub async fn accept(&mut self) -> Result<(PeekedStream, SocketAddr), NetError> {
        match &mut self.source {
            Source::Socket(listener) => {
                let (stream, peer_addr) = listener.accept().await.map_err(NetError::Accept)?;
                Ok((PeekedStream::new(stream, Bytes::new()), peer_addr))
            }
            Source::Queue(rx) => match rx.recv().await {
                Some(accepted) => Ok((accepted.stream, accepted.peer_addr)),
                None => Err(NetError::MuxClosed),
            },
        }
    }

    /// Turn the listener into a connection stream for the gRPC server.
    ///
    /// The stream ends when the multiplexer closes; other accept errors are
    /// yielded and the stream keeps going, after a pause when the process
    /// ran out of descriptors.
    pub fn into_incoming(
        self,
    ) -> impl Stream<Item = Result<PeekedStream, NetError>> + Send + Unpin + 'static {
        Box::pin(futures_util::stream::unfold(self, |mut listener| async move {
            match listener.accept().await {
                Ok((stream, _)) => Some((Ok(stream), listener)),
                Err(NetError::MuxClosed) => None,
                Err(NetError::Accept(e)) if AcceptFailure::of(&e) == AcceptFailure::Exhausted => {
                    tracing::warn!(role = %listener.role, error = %e, "Out of resources, pausing accept");
                    tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                    Some((Err(NetError::Accept(e)), listener))
                }
                Err(e) => Some((Err(e), listener)),
            }
        }))
    }
}

impl axum::serve::Listener for LogicalListener {
    type Io = PeekedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match LogicalListener::accept(self).await {
                Ok(conn) => return conn,
                // Graceful shutdown of the HTTP server ends the accept loop.
                Err(NetError::MuxClosed) => std::future::pending::<()>().await,
                Err(e) => {
                    tracing::warn!(role = %self.role, error = %e, "Accept error, backing off");
                    tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Every listener a server needs, created at start.
///
/// When the RPC and gateway ports coincide, one socket is opened and the
/// [`Multiplexer`] feeds both logical listeners; otherwise each logical
/// listener owns its socket and no sniffing happens.
pub struct ListenerSet {
    pub rpc: LogicalListener,
    pub gateway: LogicalListener,
    pub mux: Option<Multiplexer>,
}

impl ListenerSet {
    /// Bind the sockets described by `config`.
    pub async fn bind(config: &ListenerConfig, sniff: &SniffConfig) -> Result<Self, NetError> {
        let rpc_addr = config.rpc_addr().map_err(|e| NetError::BindAddr {
            addr: format!("{}:{}", config.host, config.rpc_port),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        if config.is_multiplexed() {
            let socket = bind(rpc_addr).await?;
            let (mux, rpc, gateway) = Multiplexer::new(socket, config.queue_depth, sniff.clone())?;
            tracing::info!(address = %mux.local_addr(), "Serving gRPC and HTTP on one port");
            return Ok(Self {
                rpc,
                gateway,
                mux: Some(mux),
            });
        }

        let gateway_addr = config.gateway_addr().map_err(|e| NetError::BindAddr {
            addr: format!("{}:{:?}", config.host, config.gateway_port),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
        let rpc = LogicalListener::socket(Role::Rpc, bind(rpc_addr).await?)?;
        let gateway = LogicalListener::socket(Role::Gateway, bind(gateway_addr).await?)?;
        tracing::info!(
            rpc_address = %rpc.local_addr(),
            gateway_address = %gateway.local_addr(),
            "Serving gRPC and HTTP on separate ports"
        );

        Ok(Self {
            rpc,
            gateway,
            mux: None,
        })
    }

    pub fn is_multiplexed(&self) -> bool {
        self.mux.is_some()
    }

    /// Number of sockets actually opened.
    pub fn physical_count(&self) -> usize {
        if self.is_multiplexed() {
            1
        } else {
            2
        }
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway.local_addr()
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, NetError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| NetError::BindAddr {
        addr: addr.to_string(),
        source,
    })?;
    tracing::debug!(address = %addr, "Listener bound");
    Ok(listener)
}
