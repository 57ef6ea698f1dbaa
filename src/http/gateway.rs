//! The HTTP router descriptors register their gateway routes on.

use std::collections::BTreeSet;

use axum::routing::MethodRouter;
use axum::Router;
use thiserror::Error;

/// Error type for gateway route registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Route {0:?} is already registered")]
    DuplicateRoute(String),

    #[error("Route {0:?} must start with '/'")]
    InvalidPath(String),
}

/// HTTP router for the gateway.
///
/// Wraps an axum [`Router`] so that a clash between two descriptors is
/// reported as an error instead of a panic.
#[derive(Debug, Default)]
pub struct GatewayMux {
    router: Router,
    paths: BTreeSet<String>,
    base: Option<Router>,
}

impl GatewayMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing router. Its routes answer whatever the
    /// registered gateway routes do not.
    pub fn with_base(base: Router) -> Self {
        Self {
            base: Some(base),
            ..Self::default()
        }
    }

    /// Register `methods` on `path`. Each path may be registered once.
    pub fn route(&mut self, path: &str, methods: MethodRouter) -> Result<&mut Self, GatewayError> {
        if !path.starts_with('/') {
            return Err(GatewayError::InvalidPath(path.to_string()));
        }
        if !self.paths.insert(path.to_string()) {
            return Err(GatewayError::DuplicateRoute(path.to_string()));
        }
        tracing::debug!(path = %path, "Registering gateway route");
        self.router = std::mem::take(&mut self.router).route(path, methods);
        Ok(self)
    }

    /// Paths registered so far.
    pub fn paths(&self) -> &BTreeSet<String> {
        &self.paths
    }

    pub fn into_router(self) -> Router {
        match self.base {
            Some(base) => self.router.fallback_service(base),
            None => self.router,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    #[test]
    fn rejects_duplicate_and_invalid_paths() {
        let mut mux = GatewayMux::new();
        mux.route("/v1/items", get(|| async { "a" })).unwrap();

        assert_eq!(
            mux.route("/v1/items", get(|| async { "b" })).unwrap_err(),
            GatewayError::DuplicateRoute("/v1/items".to_string())
        );
        assert_eq!(
            mux.route("v1/other", get(|| async { "c" })).unwrap_err(),
            GatewayError::InvalidPath("v1/other".to_string())
        );
        assert_eq!(mux.paths().len(), 1);
    }

    #[tokio::test]
    async fn base_router_answers_unregistered_paths() {
        let base = Router::new().route("/legacy", get(|| async { "legacy" }));
        let mut mux = GatewayMux::with_base(base);
        mux.route("/v1/items", get(|| async { "items" })).unwrap();
        let router = mux.into_router();

        let response = router
            .clone()
            .oneshot(Request::get("/legacy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(Request::get("/v1/items").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
