//! Server runtime.
//!
//! # Responsibilities
//! - Bind the listener set (fatal on failure)
//! - Apply server-level options to the descriptor
//! - Register every descriptor before any serve loop starts
//! - Run the mux, gRPC and gateway serve loops until stopped or one fails

use std::future::Future;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::Request;
use axum::response::IntoResponse;
use axum::routing::Route;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tower::{Layer, Service};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span};

use crate::config::ServerConfig;
use crate::http::{register_docs, GatewayMux};
use crate::lifecycle::{ShutdownContext, ShutdownManager};
use crate::net::ListenerSet;
use crate::server::error::ServerError;
use crate::transport::{DescOption, InterceptorChain, RpcInterceptor, RpcRegistry, ServiceDescriptor};
use crate::BoxError;

/// Lifecycle of a [`Server`]. A server starts at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Serving,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    None,
    Graceful,
    Abort,
}

/// Addresses the server actually listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub rpc: SocketAddr,
    pub gateway: SocketAddr,
    pub multiplexed: bool,
}

type HttpLayer = Box<dyn Fn(Router) -> Router + Send + Sync>;

/// gRPC server and HTTP gateway hosting one descriptor.
pub struct Server {
    config: ServerConfig,
    interceptors: InterceptorChain,
    base_router: Option<Router>,
    http_layers: Vec<HttpLayer>,
    reflection: bool,
    listeners: Mutex<Option<ListenerSet>>,
    span: Span,
    stop: watch::Sender<StopRequest>,
    state: watch::Sender<ServerState>,
    addrs: watch::Sender<Option<BoundAddrs>>,
}

impl Server {
    /// Store the configuration. Nothing is bound until [`Server::start`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            interceptors: InterceptorChain::default(),
            base_router: None,
            http_layers: Vec::new(),
            reflection: true,
            listeners: Mutex::new(None),
            span: Span::none(),
            stop: watch::channel(StopRequest::None).0,
            state: watch::channel(ServerState::Idle).0,
            addrs: watch::channel(None).0,
        }
    }

    /// Add an interceptor around every gRPC method. Interceptors added
    /// first run outermost.
    pub fn with_interceptor<I: RpcInterceptor>(mut self, interceptor: I) -> Self {
        self.interceptors = self.interceptors.then(&InterceptorChain::single(interceptor));
        self
    }

    pub fn with_interceptors(mut self, chain: InterceptorChain) -> Self {
        self.interceptors = self.interceptors.then(&chain);
        self
    }

    /// Serve gateway routes on top of an existing router.
    pub fn with_gateway_router(mut self, router: Router) -> Self {
        self.base_router = Some(router);
        self
    }

    /// Wrap every gateway route in `layer`, including the base router and
    /// the document routes. Layers added first run outermost.
    pub fn with_http_layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.http_layers
            .push(Box::new(move |router: Router| router.layer(layer.clone())));
        self
    }

    /// Serve gRPC server reflection for the registered file descriptor
    /// sets. On by default.
    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    /// Serve on already bound listeners instead of binding the configured
    /// ports at start.
    pub fn with_listeners(mut self, listeners: ListenerSet) -> Self {
        *self.listeners.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(listeners);
        self
    }

    /// Emit every server event inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound addresses, once the listeners exist.
    pub fn bound(&self) -> Option<BoundAddrs> {
        *self.addrs.borrow()
    }

    /// Wait until the listeners are bound, or `start` gave up.
    pub async fn listening(&self) -> Option<BoundAddrs> {
        let mut addrs = self.addrs.subscribe();
        let mut state = self.state.subscribe();
        let bound = tokio::select! {
            bound = addrs.wait_for(Option::is_some) => bound.ok().and_then(|addrs| *addrs),
            _ = state.wait_for(|s| *s == ServerState::Stopped) => self.bound(),
        };
        bound
    }

    /// Wait until the serve loops run. Returns false if the server stopped
    /// without serving.
    pub async fn ready(&self) -> bool {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| matches!(s, ServerState::Serving | ServerState::Stopped))
            .await;
        self.state() == ServerState::Serving
    }

    /// Bind, register `desc` and serve until stopped.
    ///
    /// Returns `Ok` after a requested stop, or the first serve loop
    /// failure once the remaining loops drained.
    pub async fn start<D: ServiceDescriptor>(&self, mut desc: D) -> Result<(), ServerError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ServerState::Idle {
                *state = ServerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ServerError::AlreadyStarted);
        }

        let result = self.serve(&mut desc).instrument(self.span.clone()).await;
        self.state.send_replace(ServerState::Stopped);
        result
    }

    /// Gracefully stop the server, waiting at most until `deadline`.
    ///
    /// In-flight gRPC calls and HTTP requests finish; new connections are
    /// refused. Loops still running at the deadline are aborted. Safe to
    /// call before or during `start`.
    pub async fn stop(&self, deadline: Instant) -> Result<(), ServerError> {
        self.request_stop();
        let mut state = self.state.subscribe();
        let stopped = timeout_at(
            deadline,
            state.wait_for(|s| matches!(s, ServerState::Idle | ServerState::Stopped)),
        )
        .await
        .is_ok();

        if stopped {
            return Ok(());
        }
        self.span.in_scope(|| tracing::warn!("Serve loops still running at the deadline, aborting"));
        self.stop.send_replace(StopRequest::Abort);
        Err(ServerError::StopTimeout)
    }

    /// Serve `desc` until the configured signals arrive, then run a full
    /// shutdown sequence.
    pub async fn run<D: ServiceDescriptor>(self, desc: D) -> Result<(), ServerError> {
        let manager = ShutdownManager::with_signals(&self.config.shutdown.signals, self.span.clone())
            .map_err(ServerError::Signal)?;
        manager.set_timeout(self.config.shutdown.timeout());
        self.run_with_manager(desc, manager).await
    }

    /// Like [`Server::run`], with a caller-owned manager.
    ///
    /// The server registers its own stop as a handler. When serving ends on
    /// its own, the manager's sequence is triggered so the other handlers
    /// still run.
    pub async fn run_with_manager<D: ServiceDescriptor>(
        self,
        desc: D,
        manager: ShutdownManager,
    ) -> Result<(), ServerError> {
        let span = self.span.clone();
        let server = Arc::new(self);
        let handle = Arc::clone(&server);
        manager.register("server", move |ctx: ShutdownContext| {
            let server = Arc::clone(&handle);
            async move { server.stop(ctx.deadline()).await.map_err(BoxError::from) }
        })?;

        let result = server.start(desc).await;
        if let Err(e) = &result {
            span.in_scope(|| tracing::error!(error = %e, "Server failed"));
        }

        if let Err(e) = manager.shutdown(None).instrument(span.clone()).await {
            span.in_scope(|| tracing::error!(error = %e, "Shutdown finished with errors"));
        }
        result
    }

    async fn serve<D: ServiceDescriptor>(&self, desc: &mut D) -> Result<(), ServerError> {
        if self.stop_requested() {
            tracing::info!("Stop requested before start");
            return Ok(());
        }

        let prebound = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let listeners = match prebound {
            Some(listeners) => listeners,
            None => ListenerSet::bind(&self.config.listener, &self.config.sniff).await?,
        };
        let addrs = BoundAddrs {
            rpc: listeners.rpc_addr(),
            gateway: listeners.gateway_addr(),
            multiplexed: listeners.is_multiplexed(),
        };
        self.addrs.send_replace(Some(addrs));

        if !self.interceptors.is_empty() {
            match desc.configurable() {
                Some(target) => {
                    target.apply(&[DescOption::UnaryInterceptor(self.interceptors.clone())])
                }
                None => tracing::warn!("Descriptor is not configurable, interceptors ignored"),
            }
        }

        let mut registry = RpcRegistry::new();
        desc.register_rpc(&mut registry);
        if self.reflection {
            registry
                .add_reflection()
                .map_err(|e| ServerError::Registration(Box::new(e)))?;
        }
        let mut gateway = match &self.base_router {
            Some(base) => GatewayMux::with_base(base.clone()),
            None => GatewayMux::new(),
        };
        desc.register_gateway(&mut gateway)
            .map_err(ServerError::Registration)?;
        let document = desc.document_bytes()?;
        register_docs(&mut gateway, document).map_err(|e| ServerError::Registration(Box::new(e)))?;
        tracing::info!(
            services = ?registry.services(),
            routes = gateway.paths().len(),
            "Registration complete"
        );

        if self.stop_requested() {
            tracing::info!("Stop requested during start");
            return Ok(());
        }

        let ListenerSet { rpc, gateway: gateway_listener, mux } = listeners;
        let mut loops: JoinSet<Result<(), ServerError>> = JoinSet::new();

        if let Some(mux) = mux {
            let closer = mux.closer();
            let stopped = self.stop_signal();
            loops.spawn(
                async move {
                    let mut serve = std::pin::pin!(mux.serve());
                    let result = tokio::select! {
                        result = &mut serve => result,
                        _ = stopped => {
                            closer.close();
                            serve.await
                        }
                    };
                    result.map_err(|e| ServerError::serve("mux", e))
                }
                .in_current_span(),
            );
        }

        let routes = registry.into_routes();
        let incoming = rpc.into_incoming();
        let stopped = self.stop_signal();
        loops.spawn(
            async move {
                tracing::info!(address = %addrs.rpc, "gRPC server starting");
                match tonic::transport::Server::builder()
                    .add_routes(routes)
                    .serve_with_incoming_shutdown(incoming, stopped)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("gRPC server stopped");
                        Ok(())
                    }
                    Err(e) => Err(ServerError::serve("grpc", e)),
                }
            }
            .in_current_span(),
        );

        let router = self
            .http_layers
            .iter()
            .rev()
            .fold(gateway.into_router(), |router, layer| layer(router))
            .layer(TraceLayer::new_for_http());
        let stopped = self.stop_signal();
        loops.spawn(
            async move {
                tracing::info!(address = %addrs.gateway, "HTTP gateway starting");
                match axum::serve(gateway_listener, router)
                    .with_graceful_shutdown(stopped)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("HTTP gateway stopped");
                        Ok(())
                    }
                    Err(e) => Err(ServerError::serve("gateway", e)),
                }
            }
            .in_current_span(),
        );

        self.state.send_replace(ServerState::Serving);
        tracing::info!(
            rpc_address = %addrs.rpc,
            gateway_address = %addrs.gateway,
            multiplexed = addrs.multiplexed,
            "Server started"
        );

        self.drain(loops).await
    }

    /// Wait for every serve loop, keeping the first unexpected failure.
    async fn drain(&self, mut loops: JoinSet<Result<(), ServerError>>) -> Result<(), ServerError> {
        let mut abort = self.stop.subscribe();
        let mut first_error: Option<ServerError> = None;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let joined = tokio::select! {
                joined = loops.join_next() => joined,
                _ = aborted(&mut abort) => {
                    loops.shutdown().await;
                    break;
                }
                _ = sleep_until(drain_deadline) => {
                    tracing::warn!("Serve loops did not drain in time, aborting");
                    loops.shutdown().await;
                    break;
                }
            };
            let Some(joined) = joined else { break };

            match joined.unwrap_or_else(|e| Err(ServerError::serve("task", e))) {
                Ok(()) => {}
                Err(e) if e.is_expected_close() => {
                    tracing::debug!(error = %e, "Serve loop closed");
                }
                Err(e) if first_error.is_none() => {
                    tracing::error!(error = %e, "Serve loop failed, stopping server");
                    self.request_stop();
                    drain_deadline = Some(Instant::now() + self.config.shutdown.timeout());
                    first_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Serve loop failed during shutdown");
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Server stopped");
                Ok(())
            }
        }
    }

    fn request_stop(&self) {
        self.stop.send_if_modified(|request| {
            if *request == StopRequest::None {
                *request = StopRequest::Graceful;
                true
            } else {
                false
            }
        });
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow() != StopRequest::None
    }

    /// Resolves once a stop has been requested.
    fn stop_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.stop.subscribe();
        async move {
            let _ = rx.wait_for(|r| *r != StopRequest::None).await;
        }
    }
}

async fn aborted(rx: &mut watch::Receiver<StopRequest>) {
    let _ = rx.wait_for(|r| *r == StopRequest::Abort).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CompoundServiceDesc;
    use std::time::Duration;

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.listener.host = "127.0.0.1".to_string();
        config.listener.rpc_port = 0;
        config
    }

    #[tokio::test]
    async fn stop_before_start_serves_nothing() {
        let server = Server::new(local_config());
        server.stop(Instant::now() + Duration::from_secs(1)).await.unwrap();

        server.start(CompoundServiceDesc::default()).await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.bound().is_none());
    }

    #[tokio::test]
    async fn starts_only_once() {
        let server = Arc::new(Server::new(local_config()));
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start(CompoundServiceDesc::default()).await }
        });
        assert!(server.ready().await);

        assert!(matches!(
            server.start(CompoundServiceDesc::default()).await,
            Err(ServerError::AlreadyStarted)
        ));

        server.stop(Instant::now() + Duration::from_secs(5)).await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listener.rpc_port = taken.local_addr().unwrap().port();

        let server = Server::new(config);
        let err = server.start(CompoundServiceDesc::default()).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
        assert!(!server.ready().await);
    }
}
