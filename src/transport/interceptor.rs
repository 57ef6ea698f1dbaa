//! gRPC call interception.
//!
//! An [`RpcInterceptor`] wraps every method invocation of a service: it
//! receives the call and a [`Next`] continuation, and may inspect or modify
//! the request, short-circuit with its own response, or post-process the
//! response returned by `next.run(call)`.
//!
//! Several interceptors compose into one [`InterceptorChain`]; the first one
//! added is the outermost.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http;
use futures_util::future::BoxFuture;
use tonic::server::NamedService;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// HTTP/2 request carrying one gRPC call.
pub type RpcRequest = http::Request<tonic::body::Body>;

/// HTTP/2 response carrying one gRPC result.
pub type RpcResponse = http::Response<tonic::body::Body>;

/// A gRPC method invocation on its way to the service.
#[derive(Debug)]
pub struct RpcCall {
    request: RpcRequest,
}

impl RpcCall {
    pub fn new(request: RpcRequest) -> Self {
        Self { request }
    }

    /// Full method name, e.g. `/grpc.health.v1.Health/Check`.
    pub fn method(&self) -> &str {
        self.request.uri().path()
    }

    pub fn request(&self) -> &RpcRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RpcRequest {
        &mut self.request
    }

    pub fn into_request(self) -> RpcRequest {
        self.request
    }
}

/// Hook wrapping each gRPC method invocation.
pub trait RpcInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: RpcCall, next: Next) -> BoxFuture<'static, RpcResponse>;
}

impl<F, Fut> RpcInterceptor for F
where
    F: Fn(RpcCall, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResponse> + Send + 'static,
{
    fn intercept(&self, call: RpcCall, next: Next) -> BoxFuture<'static, RpcResponse> {
        Box::pin(self(call, next))
    }
}

/// Ordered, immutable list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn RpcInterceptor>]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn RpcInterceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn single<I: RpcInterceptor>(interceptor: I) -> Self {
        Self::new(vec![Arc::new(interceptor)])
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// A chain running `self` first, then `inner`.
    pub fn then(&self, inner: &InterceptorChain) -> InterceptorChain {
        let mut combined = Vec::with_capacity(self.len() + inner.len());
        combined.extend(self.interceptors.iter().cloned());
        combined.extend(inner.interceptors.iter().cloned());
        Self::new(combined)
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.len())
            .finish()
    }
}

/// The rest of the chain, ending in the service itself.
pub struct Next {
    chain: InterceptorChain,
    index: usize,
    service: BoxCloneService<RpcRequest, RpcResponse, Infallible>,
}

impl Next {
    /// Pass the call on to the next interceptor, or to the service.
    pub async fn run(self, call: RpcCall) -> RpcResponse {
        match self.chain.interceptors.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                interceptor.intercept(call, next).await
            }
            None => match self.service.oneshot(call.into_request()).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
        }
    }
}

/// A gRPC service whose calls run through an [`InterceptorChain`].
#[derive(Clone)]
pub struct Intercepted<S> {
    inner: S,
    chain: InterceptorChain,
}

impl<S> Intercepted<S> {
    pub fn new(inner: S, chain: InterceptorChain) -> Self {
        Self { inner, chain }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }
}

impl<S> Service<RpcRequest> for Intercepted<S>
where
    S: Service<RpcRequest, Response = RpcResponse, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = RpcResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<RpcResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked on the clone that handles the call.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RpcRequest) -> Self::Future {
        let next = Next {
            chain: self.chain.clone(),
            index: 0,
            service: BoxCloneService::new(self.inner.clone()),
        };
        Box::pin(async move { Ok(next.run(RpcCall::new(request)).await) })
    }
}

impl<S: NamedService> NamedService for Intercepted<S> {
    const NAME: &'static str = S::NAME;
}
