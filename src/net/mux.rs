//! Single-port protocol multiplexer.
//!
//! # Responsibilities
//! - Own the one physical socket shared by gRPC and the HTTP gateway
//! - Classify each accepted connection by its leading bytes
//! - Queue classified connections for the matching logical listener
//!
//! # Design Decisions
//! - The HTTP/2 client preface is tested first; everything else is HTTP
//! - Sniffing runs in a task per connection so the accept loop never waits
//! - Silent connections follow [`SniffPolicy`] once the read window elapses
//! - Running out of descriptors or memory pauses accepting instead of
//!   ending the loop
//! - Closing the multiplexer drops the queue senders, which in turn closes
//!   both logical listeners

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};

use crate::config::{SniffConfig, SniffPolicy};
use crate::net::connection::PeekedStream;
use crate::net::listener::{LogicalListener, NetError};
use crate::observability::metrics;

/// Connection preface every HTTP/2 client, and so every gRPC client, sends first.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const PREFACE_LEN: usize = HTTP2_PREFACE.len();

/// Pause after an accept failed for lack of descriptors or memory.
pub(crate) const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(50);

/// The logical destination of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Rpc,
    Gateway,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Rpc => "rpc",
            Role::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of sniffing one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Where the connection goes; `None` means close it.
    pub role: Option<Role>,
    /// Every byte read while classifying.
    pub peeked: Bytes,
}

/// Read just enough of `stream` to decide its role.
///
/// Reads stop as soon as the bytes diverge from [`HTTP2_PREFACE`] or match it
/// completely, so at most `HTTP2_PREFACE.len()` bytes are consumed. If the
/// window elapses first, `policy` decides. A peer that closes without
/// sending anything is dropped.
pub async fn classify<S>(
    stream: &mut S,
    window: Duration,
    policy: SniffPolicy,
) -> std::io::Result<Classification>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    let mut peeked = BytesMut::with_capacity(PREFACE_LEN);
    let mut chunk = [0u8; PREFACE_LEN];

    loop {
        let want = PREFACE_LEN - peeked.len();
        let role = match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Err(_elapsed) => match policy {
                SniffPolicy::FailOpen => Some(Role::Gateway),
                SniffPolicy::FailClosed => None,
            },
            Ok(Ok(0)) if peeked.is_empty() => None,
            Ok(Ok(0)) => Some(Role::Gateway),
            Ok(Ok(n)) => {
                peeked.extend_from_slice(&chunk[..n]);
                if !HTTP2_PREFACE.starts_with(&peeked) {
                    Some(Role::Gateway)
                } else if peeked.len() == PREFACE_LEN {
                    Some(Role::Rpc)
                } else {
                    continue;
                }
            }
            Ok(Err(e)) => return Err(e),
        };

        return Ok(Classification {
            role,
            peeked: peeked.freeze(),
        });
    }
}

/// A connection queued for a logical listener.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub stream: PeekedStream,
    pub peer_addr: SocketAddr,
}

/// Closes a running [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct MuxCloser {
    tx: watch::Sender<bool>,
}

impl MuxCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

/// Source of physical connections for a [`Multiplexer`].
pub trait Acceptor: Send + Sync + 'static {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>>;
}

impl Acceptor for TcpListener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

/// What an accept error means for the loop that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptFailure {
    /// One pending connection failed; the socket is fine.
    Connection,
    /// The process is out of descriptors or memory; retry after a pause.
    Exhausted,
    /// The socket itself is unusable.
    Fatal,
}

impl AcceptFailure {
    pub(crate) fn of(e: &io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            ConnectionRefused | ConnectionAborted | ConnectionReset | Interrupted | WouldBlock => {
                AcceptFailure::Connection
            }
            OutOfMemory => AcceptFailure::Exhausted,
            _ if is_resource_errno(e.raw_os_error()) => AcceptFailure::Exhausted,
            _ => AcceptFailure::Fatal,
        }
    }
}

#[cfg(unix)]
fn is_resource_errno(code: Option<i32>) -> bool {
    matches!(
        code,
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_errno(_code: Option<i32>) -> bool {
    false
}

/// Accept loop of a shared socket feeding two logical listeners.
pub struct Multiplexer {
    listener: Box<dyn Acceptor>,
    local_addr: SocketAddr,
    rpc_tx: mpsc::Sender<Accepted>,
    gateway_tx: mpsc::Sender<Accepted>,
    sniff: SniffConfig,
    closed_tx: watch::Sender<bool>,
}

impl Multiplexer {
    /// Wrap a bound socket, returning the multiplexer and its RPC and
    /// gateway listeners.
    pub fn new(
        listener: TcpListener,
        queue_depth: usize,
        sniff: SniffConfig,
    ) -> Result<(Self, LogicalListener, LogicalListener), NetError> {
        let local_addr = listener.local_addr().map_err(NetError::Bind)?;
        Ok(Self::with_acceptor(listener, local_addr, queue_depth, sniff))
    }

    /// Like [`Multiplexer::new`], accepting from any [`Acceptor`] that
    /// listens on `local_addr`.
    pub fn with_acceptor<A: Acceptor>(
        acceptor: A,
        local_addr: SocketAddr,
        queue_depth: usize,
        sniff: SniffConfig,
    ) -> (Self, LogicalListener, LogicalListener) {
        let depth = queue_depth.max(1);
        let (rpc_tx, rpc_rx) = mpsc::channel(depth);
        let (gateway_tx, gateway_rx) = mpsc::channel(depth);
        let (closed_tx, _) = watch::channel(false);

        let mux = Self {
            listener: Box::new(acceptor),
            local_addr,
            rpc_tx,
            gateway_tx,
            sniff,
            closed_tx,
        };
        (
            mux,
            LogicalListener::queued(Role::Rpc, local_addr, rpc_rx),
            LogicalListener::queued(Role::Gateway, local_addr, gateway_rx),
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn closer(&self) -> MuxCloser {
        MuxCloser {
            tx: self.closed_tx.clone(),
        }
    }

    /// Run the accept loop until closed or a non-transient accept error.
    ///
    /// Always returns an error; [`NetError::MuxClosed`] is the normal
    /// result of [`MuxCloser::close`].
    pub async fn serve(self) -> Result<(), NetError> {
        let mut closed = self.closed_tx.subscribe();
        tracing::info!(address = %self.local_addr, "Multiplexer accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                accepted = std::future::poll_fn(|cx| self.listener.poll_accept(cx)) => accepted,
            };

            let e = match accepted {
                Ok((stream, peer_addr)) => {
                    self.dispatch(stream, peer_addr);
                    continue;
                }
                Err(e) => e,
            };
            match AcceptFailure::of(&e) {
                AcceptFailure::Connection => {
                    tracing::debug!(error = %e, "Transient accept error");
                }
                AcceptFailure::Exhausted => {
                    tracing::warn!(error = %e, "Out of resources, pausing accept");
                    metrics::record_mux_accept_paused();
                    tokio::select! {
                        _ = closed.wait_for(|closed| *closed) => break,
                        _ = tokio::time::sleep(EXHAUSTED_BACKOFF) => {}
                    }
                }
                AcceptFailure::Fatal => {
                    tracing::error!(error = %e, "Multiplexer accept failed");
                    return Err(NetError::Accept(e));
                }
            }
        }

        tracing::info!(address = %self.local_addr, "Multiplexer closed");
        Err(NetError::MuxClosed)
    }

    fn dispatch(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let rpc_tx = self.rpc_tx.clone();
        let gateway_tx = self.gateway_tx.clone();
        let window = self.sniff.timeout();
        let policy = self.sniff.policy;

        tokio::spawn(async move {
            let classification = match classify(&mut stream, window, policy).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(peer_addr = %peer_addr, error = %e, "Sniffing failed");
                    metrics::record_mux_dropped("read_error");
                    return;
                }
            };

            let Some(role) = classification.role else {
                tracing::debug!(peer_addr = %peer_addr, "Dropping unclassified connection");
                metrics::record_mux_dropped("unclassified");
                return;
            };

            let stream = PeekedStream::new(stream, classification.peeked);
            tracing::trace!(
                connection_id = %stream.id(),
                peer_addr = %peer_addr,
                role = %role,
                "Connection classified"
            );
            metrics::record_mux_connection(role);

            let tx = match role {
                Role::Rpc => rpc_tx,
                Role::Gateway => gateway_tx,
            };
            if tx.send(Accepted { stream, peer_addr }).await.is_err() {
                tracing::debug!(peer_addr = %peer_addr, role = %role, "Listener gone, dropping connection");
                metrics::record_mux_dropped("listener_closed");
            }
        });
    }
}
