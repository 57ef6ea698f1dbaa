//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::HealthCheckRequest;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

use twinport::net::Acceptor;
use twinport::server::BoundAddrs;
use twinport::{Server, ServerConfig, ServerError, ServiceDescriptor, ServiceDesc};

/// Loopback config; one shared ephemeral port, or two when `separate`.
pub fn local_config(separate: bool) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.host = "127.0.0.1".to_string();
    config.listener.rpc_port = 0;
    config.listener.gateway_port = separate.then_some(0);
    config.sniff.timeout_ms = 200;
    config.shutdown.timeout_secs = 5;
    config.shutdown.signals = Vec::new();
    config
}

/// The standard health service; the default service reports SERVING.
pub fn health_desc() -> ServiceDesc<HealthServer<impl Health>> {
    let (_reporter, service) = tonic_health::server::health_reporter();
    ServiceDesc::new(service).with_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
}

pub struct RunningServer {
    pub server: Arc<Server>,
    pub addrs: BoundAddrs,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// Stop the server and return what `start` returned.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.server
            .stop(tokio::time::Instant::now() + Duration::from_secs(5))
            .await?;
        self.task.await.expect("server task panicked")
    }
}

/// Start `server` in the background and wait until it serves.
pub async fn spawn_server<D>(server: Server, desc: D) -> RunningServer
where
    D: ServiceDescriptor + 'static,
{
    let server = Arc::new(server);
    let task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start(desc).await }
    });
    assert!(server.ready().await, "server did not start");
    let addrs = server.bound().expect("bound addresses");
    RunningServer { server, addrs, task }
}

pub async fn grpc_health(addr: SocketAddr) -> Result<ServingStatus, tonic::Status> {
    let channel = async {
        tonic::transport::Endpoint::new(format!("http://{addr}"))?
            .connect()
            .await
    }
    .await
    .map_err(|e: tonic::transport::Error| tonic::Status::unavailable(e.to_string()))?;
    let mut client = HealthClient::new(channel);
    let response = client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await?;
    Ok(ServingStatus::try_from(response.into_inner().status).unwrap_or(ServingStatus::Unknown))
}

/// Names listed by the server's reflection service.
pub async fn reflected_services(addr: SocketAddr) -> Result<Vec<String>, tonic::Status> {
    let channel = async {
        tonic::transport::Endpoint::new(format!("http://{addr}"))?
            .connect()
            .await
    }
    .await
    .map_err(|e: tonic::transport::Error| tonic::Status::unavailable(e.to_string()))?;
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut responses = client
        .server_reflection_info(futures_util::stream::iter([request]))
        .await?
        .into_inner();
    match responses.message().await?.and_then(|r| r.message_response) {
        Some(MessageResponse::ListServicesResponse(list)) => {
            Ok(list.service.into_iter().map(|s| s.name).collect())
        }
        other => Err(tonic::Status::internal(format!("unexpected reply: {other:?}"))),
    }
}

/// HTTP/1.1 client that reports redirects instead of following them.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Reserve a free loopback port for configs that cannot use port 0.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait until something accepts TCP connections on `addr`.
pub async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}

/// Switches for the failures a [`FaultyAcceptor`] injects.
#[derive(Clone, Default)]
pub struct AcceptFaults {
    exhausted: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl AcceptFaults {
    /// Fail the next `n` accepts as if the process ran out of memory.
    pub fn exhaust(&self, n: usize) {
        self.exhausted.store(n, Ordering::SeqCst);
    }

    /// Fail every accept from now on as if the socket became unusable.
    pub fn break_socket(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

/// A loopback socket whose accepts fail on demand. Each injected failure
/// consumes and closes one real connection.
pub struct FaultyAcceptor {
    inner: TcpListener,
    faults: AcceptFaults,
}

impl Acceptor for FaultyAcceptor {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        let (stream, peer_addr) = ready!(self.inner.poll_accept(cx))?;
        if self.faults.broken.load(Ordering::SeqCst) {
            drop(stream);
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listening socket torn down",
            )));
        }
        let exhausted = self
            .faults
            .exhausted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if exhausted {
            drop(stream);
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::OutOfMemory)));
        }
        Poll::Ready(Ok((stream, peer_addr)))
    }
}

pub async fn faulty_acceptor() -> (FaultyAcceptor, SocketAddr, AcceptFaults) {
    let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = inner.local_addr().unwrap();
    let faults = AcceptFaults::default();
    let acceptor = FaultyAcceptor {
        inner,
        faults: faults.clone(),
    };
    (acceptor, addr, faults)
}
