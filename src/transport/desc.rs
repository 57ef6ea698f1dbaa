//! Ready-made descriptor for a single tonic service.

use std::convert::Infallible;
use std::fmt;

use bytes::Bytes;
use tonic::server::NamedService;
use tower::Service;

use crate::http::GatewayMux;
use crate::transport::descriptor::{Configurable, DescOption, DescOptions, ServiceDescriptor};
use crate::transport::document::DocumentError;
use crate::transport::interceptor::{Intercepted, RpcRequest, RpcResponse};
use crate::transport::registry::RpcRegistry;
use crate::BoxError;

type GatewayFn = Box<dyn Fn(&mut GatewayMux) -> Result<(), BoxError> + Send + Sync>;

/// Descriptor pairing a tonic service with its gateway routes and document.
///
/// Configurable: an applied interceptor wraps the service on registration.
pub struct ServiceDesc<S> {
    service: S,
    gateway: Option<GatewayFn>,
    document: Bytes,
    file_descriptor_set: Option<&'static [u8]>,
    options: DescOptions,
}

impl<S> ServiceDesc<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            gateway: None,
            document: Bytes::new(),
            file_descriptor_set: None,
            options: DescOptions::default(),
        }
    }

    /// Routes added to the gateway on registration.
    pub fn with_gateway<F>(mut self, register: F) -> Self
    where
        F: Fn(&mut GatewayMux) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.gateway = Some(Box::new(register));
        self
    }

    pub fn with_document(mut self, document: impl Into<Bytes>) -> Self {
        self.document = document.into();
        self
    }

    /// Encoded `FileDescriptorSet` describing the service to reflection
    /// clients.
    pub fn with_file_descriptor_set(mut self, set: &'static [u8]) -> Self {
        self.file_descriptor_set = Some(set);
        self
    }

    pub fn options(&self) -> &DescOptions {
        &self.options
    }
}

impl<S> fmt::Debug for ServiceDesc<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDesc")
            .field("service", &std::any::type_name::<S>())
            .field("gateway", &self.gateway.is_some())
            .field("document_len", &self.document.len())
            .field("file_descriptor_set", &self.file_descriptor_set.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl<S> ServiceDescriptor for ServiceDesc<S>
where
    S: Service<RpcRequest, Response = RpcResponse, Error = Infallible>
        + NamedService
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    fn register_rpc(&self, registry: &mut RpcRegistry) {
        let chain = self.options.interceptor().cloned().unwrap_or_default();
        registry.add_service(Intercepted::new(self.service.clone(), chain));
        if let Some(set) = self.file_descriptor_set {
            registry.add_file_descriptor_set(set);
        }
    }

    fn register_gateway(&self, mux: &mut GatewayMux) -> Result<(), BoxError> {
        match &self.gateway {
            Some(register) => register(mux),
            None => Ok(()),
        }
    }

    fn document_bytes(&self) -> Result<Bytes, DocumentError> {
        Ok(self.document.clone())
    }

    fn configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl<S> Configurable for ServiceDesc<S> {
    fn apply(&mut self, options: &[DescOption]) {
        self.options.apply(options);
    }
}
