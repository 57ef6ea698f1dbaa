//! Several descriptors presented as one.

use bytes::Bytes;

use crate::http::GatewayMux;
use crate::transport::descriptor::{Configurable, DescOption, ServiceDescriptor};
use crate::transport::document::{DocumentError, DocumentMerger};
use crate::transport::registry::RpcRegistry;
use crate::BoxError;

/// An ordered list of descriptors behaving as a single descriptor.
///
/// Order matters: children register in order and later documents win
/// merge conflicts. An empty compound is a valid no-op service.
#[derive(Default)]
pub struct CompoundServiceDesc {
    services: Vec<Box<dyn ServiceDescriptor>>,
}

impl CompoundServiceDesc {
    pub fn new(services: Vec<Box<dyn ServiceDescriptor>>) -> Self {
        Self { services }
    }

    pub fn push<D: ServiceDescriptor + 'static>(mut self, service: D) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceDescriptor for CompoundServiceDesc {
    fn register_rpc(&self, registry: &mut RpcRegistry) {
        for service in &self.services {
            service.register_rpc(registry);
        }
    }

    /// Stops at the first failing child and returns its error as is.
    fn register_gateway(&self, mux: &mut GatewayMux) -> Result<(), BoxError> {
        for service in &self.services {
            service.register_gateway(mux)?;
        }
        Ok(())
    }

    fn document_bytes(&self) -> Result<Bytes, DocumentError> {
        let mut merger = DocumentMerger::new();
        for service in &self.services {
            merger.add_definition(&service.document_bytes()?)?;
        }
        merger.sum_definitions()
    }

    fn configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for CompoundServiceDesc {
    fn apply(&mut self, options: &[DescOption]) {
        for service in &mut self.services {
            if let Some(target) = service.configurable() {
                target.apply(options);
            }
        }
    }
}

impl std::fmt::Debug for CompoundServiceDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompoundServiceDesc")
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::interceptor::{InterceptorChain, Next, RpcCall};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    #[error("{0} failed")]
    struct Boom(&'static str);

    /// Records every call; optionally fails gateway registration.
    struct Recorder {
        name: &'static str,
        fail: bool,
        configurable: bool,
        document: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        applied: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new(name: &'static str, calls: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail: false,
                configurable: false,
                document: "",
                calls: calls.clone(),
                applied: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ServiceDescriptor for Recorder {
        fn register_rpc(&self, _registry: &mut RpcRegistry) {
            self.calls.lock().unwrap().push(format!("rpc {}", self.name));
        }

        fn register_gateway(&self, mux: &mut GatewayMux) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(format!("gateway {}", self.name));
            if self.fail {
                return Err(Box::new(Boom(self.name)));
            }
            mux.route(&format!("/{}", self.name), get(|| async { "ok" }))?;
            Ok(())
        }

        fn document_bytes(&self) -> Result<Bytes, DocumentError> {
            Ok(Bytes::from_static(self.document.as_bytes()))
        }

        fn configurable(&mut self) -> Option<&mut dyn Configurable> {
            if self.configurable {
                Some(self)
            } else {
                None
            }
        }
    }

    impl Configurable for Recorder {
        fn apply(&mut self, _options: &[DescOption]) {
            self.applied.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn gateway_registration_fails_fast() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut b = Recorder::new("b", &calls);
        b.fail = true;
        let compound = CompoundServiceDesc::default()
            .push(Recorder::new("a", &calls))
            .push(b)
            .push(Recorder::new("c", &calls));

        let mut mux = GatewayMux::new();
        let err = compound.register_gateway(&mut mux).unwrap_err();

        assert_eq!(err.to_string(), "b failed");
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(*calls.lock().unwrap(), vec!["gateway a", "gateway b"]);
        assert!(mux.paths().contains("/a"));
        assert!(!mux.paths().contains("/c"));
    }

    #[test]
    fn rpc_registration_runs_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let compound = CompoundServiceDesc::default()
            .push(Recorder::new("a", &calls))
            .push(Recorder::new("b", &calls));

        compound.register_rpc(&mut RpcRegistry::new());
        assert_eq!(*calls.lock().unwrap(), vec!["rpc a", "rpc b"]);
    }

    #[test]
    fn options_reach_configurable_children_only() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut a = Recorder::new("a", &calls);
        a.configurable = true;
        let a_applied = a.applied.clone();
        let b = Recorder::new("b", &calls);
        let b_applied = b.applied.clone();

        let mut compound = CompoundServiceDesc::default().push(a).push(b);
        let chain = InterceptorChain::single(|call: RpcCall, next: Next| next.run(call));
        compound
            .configurable()
            .unwrap()
            .apply(&[DescOption::UnaryInterceptor(chain)]);

        assert_eq!(a_applied.load(Ordering::SeqCst), 1);
        assert_eq!(b_applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn documents_merge_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut a = Recorder::new("a", &calls);
        a.document = r#"{"paths":{"/a":{"get":{}}},"definitions":{"X":{}}}"#;
        let mut b = Recorder::new("b", &calls);
        b.document = r#"{"paths":{"/b":{"get":{}}},"definitions":{"Y":{}}}"#;
        let compound = CompoundServiceDesc::default().push(a).push(b);

        let merged: serde_json::Value =
            serde_json::from_slice(&compound.document_bytes().unwrap()).unwrap();
        assert!(merged["paths"]["/a"].is_object());
        assert!(merged["paths"]["/b"].is_object());
        assert!(merged["definitions"]["X"].is_object());
        assert!(merged["definitions"]["Y"].is_object());
    }

    #[test]
    fn malformed_child_document_fails_merge() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut a = Recorder::new("a", &calls);
        a.document = "{oops";
        let compound = CompoundServiceDesc::default().push(a);
        assert!(compound.document_bytes().is_err());
    }

    #[test]
    fn empty_compound_is_a_no_op() {
        let mut compound = CompoundServiceDesc::default();
        assert!(compound.is_empty());

        let mut registry = RpcRegistry::new();
        compound.register_rpc(&mut registry);
        assert!(registry.is_empty());

        let mut mux = GatewayMux::new();
        compound.register_gateway(&mut mux).unwrap();
        assert!(mux.paths().is_empty());

        compound.configurable().unwrap().apply(&[]);

        let doc: serde_json::Value =
            serde_json::from_slice(&compound.document_bytes().unwrap()).unwrap();
        assert_eq!(doc["paths"], serde_json::json!({}));
    }
}
