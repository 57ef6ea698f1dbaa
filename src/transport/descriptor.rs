//! The contract a hosted service exposes to the server.

use bytes::Bytes;

use crate::http::GatewayMux;
use crate::transport::document::DocumentError;
use crate::transport::interceptor::InterceptorChain;
use crate::transport::registry::RpcRegistry;
use crate::BoxError;

/// Registration and documentation surface of one hosted service.
pub trait ServiceDescriptor: Send + Sync {
    /// Bind the service's gRPC methods onto the RPC server.
    fn register_rpc(&self, registry: &mut RpcRegistry);

    /// Bind the HTTP/JSON routes that front the gRPC methods.
    fn register_gateway(&self, mux: &mut GatewayMux) -> Result<(), BoxError>;

    /// Raw API-description document. Empty means none.
    fn document_bytes(&self) -> Result<Bytes, DocumentError>;

    /// Option hook, when this descriptor accepts [`DescOption`]s.
    fn configurable(&mut self) -> Option<&mut dyn Configurable> {
        None
    }
}

impl<T: ServiceDescriptor + ?Sized> ServiceDescriptor for Box<T> {
    fn register_rpc(&self, registry: &mut RpcRegistry) {
        (**self).register_rpc(registry)
    }

    fn register_gateway(&self, mux: &mut GatewayMux) -> Result<(), BoxError> {
        (**self).register_gateway(mux)
    }

    fn document_bytes(&self) -> Result<Bytes, DocumentError> {
        (**self).document_bytes()
    }

    fn configurable(&mut self) -> Option<&mut dyn Configurable> {
        (**self).configurable()
    }
}

/// A descriptor-level option, applied once before serving starts.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DescOption {
    /// Wrap every gRPC method invocation in this chain.
    UnaryInterceptor(InterceptorChain),
}

/// Descriptors that accept [`DescOption`]s.
pub trait Configurable {
    fn apply(&mut self, options: &[DescOption]);
}

/// Accumulated [`DescOption`]s of one descriptor.
#[derive(Debug, Clone, Default)]
pub struct DescOptions {
    interceptor: Option<InterceptorChain>,
}

impl DescOptions {
    /// Fold `options` in. A new interceptor runs inside any earlier one.
    pub fn apply(&mut self, options: &[DescOption]) {
        for option in options {
            match option {
                DescOption::UnaryInterceptor(chain) => {
                    self.interceptor = Some(match self.interceptor.take() {
                        Some(existing) => existing.then(chain),
                        None => chain.clone(),
                    });
                }
            }
        }
    }

    pub fn interceptor(&self) -> Option<&InterceptorChain> {
        self.interceptor.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::interceptor::{Next, RpcCall};

    fn passthrough() -> InterceptorChain {
        InterceptorChain::single(|call: RpcCall, next: Next| next.run(call))
    }

    #[test]
    fn interceptor_options_chain() {
        let mut options = DescOptions::default();
        assert!(options.interceptor().is_none());

        options.apply(&[DescOption::UnaryInterceptor(passthrough())]);
        assert_eq!(options.interceptor().map(InterceptorChain::len), Some(1));

        options.apply(&[
            DescOption::UnaryInterceptor(passthrough()),
            DescOption::UnaryInterceptor(passthrough()),
        ]);
        assert_eq!(options.interceptor().map(InterceptorChain::len), Some(3));
    }
}
