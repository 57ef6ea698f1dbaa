//! Service description subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceDesc / CompoundServiceDesc (ServiceDescriptor)
//!     → configurable().apply([UnaryInterceptor])   once, before serving
//!     → register_rpc(RpcRegistry)                  tonic routes
//!     → register_gateway(GatewayMux)               axum routes, fail-fast
//!     → document_bytes()                           merged by DocumentMerger
//! ```

pub mod compound;
pub mod desc;
pub mod descriptor;
pub mod document;
pub mod interceptor;
pub mod registry;

pub use compound::CompoundServiceDesc;
pub use desc::ServiceDesc;
pub use descriptor::{Configurable, DescOption, DescOptions, ServiceDescriptor};
pub use document::{DocumentError, DocumentMerger, DocumentSet};
pub use interceptor::{
    Intercepted, InterceptorChain, Next, RpcCall, RpcInterceptor, RpcRequest, RpcResponse,
};
pub use registry::RpcRegistry;
