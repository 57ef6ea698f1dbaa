//! Collection of gRPC services registered before the RPC server starts.

use std::convert::Infallible;

use axum::http;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tower::Service;

/// The RPC server handle descriptors register their services on.
#[derive(Debug, Default)]
pub struct RpcRegistry {
    routes: RoutesBuilder,
    services: Vec<&'static str>,
    file_descriptor_sets: Vec<&'static [u8]>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gRPC service, routed by its fully-qualified name.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<http::Request<tonic::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        tracing::debug!(service = S::NAME, "Registering gRPC service");
        self.routes.add_service(service);
        self.services.push(S::NAME);
        self
    }

    /// Describe registered services to reflection clients with an encoded
    /// `FileDescriptorSet`.
    pub fn add_file_descriptor_set(&mut self, set: &'static [u8]) -> &mut Self {
        self.file_descriptor_sets.push(set);
        self
    }

    /// Register the `grpc.reflection.v1.ServerReflection` service over
    /// every descriptor set added so far.
    pub(crate) fn add_reflection(&mut self) -> Result<(), tonic_reflection::server::Error> {
        let service = self
            .file_descriptor_sets
            .iter()
            .copied()
            .fold(
                tonic_reflection::server::Builder::configure(),
                |builder, set| builder.register_encoded_file_descriptor_set(set),
            )
            .build_v1()?;
        self.add_service(service);
        Ok(())
    }

    /// Names of the registered services, in registration order.
    pub fn services(&self) -> &[&'static str] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn into_routes(self) -> Routes {
        self.routes.routes()
    }
}
