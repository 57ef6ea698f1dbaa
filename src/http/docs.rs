//! Routes publishing the merged API-description document.
//!
//! ```text
//! GET /swagger.json       → the document bytes, verbatim
//! GET /docs               → 301 /docs/
//! GET /docs/              → Swagger UI page reading /swagger.json
//! GET /docs/swagger.json  → 301 /swagger.json
//! ```

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use bytes::Bytes;

use crate::http::gateway::{GatewayError, GatewayMux};

pub const DOCUMENT_PATH: &str = "/swagger.json";
pub const VIEWER_PATH: &str = "/docs/";

const VIEWER_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>API documentation</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: "/swagger.json", dom_id: "#swagger-ui" });
    };
  </script>
</body>
</html>
"##;

/// Add the document and viewer routes to `mux`.
pub fn register_docs(mux: &mut GatewayMux, document: Bytes) -> Result<(), GatewayError> {
    mux.route(
        DOCUMENT_PATH,
        get(move || {
            let document = document.clone();
            async move { ([(header::CONTENT_TYPE, "application/json")], document) }
        }),
    )?
    .route("/docs", get(|| async { moved_permanently(VIEWER_PATH) }))?
    .route(VIEWER_PATH, get(|| async { Html(VIEWER_HTML) }))?
    .route("/docs/swagger.json", get(|| async { moved_permanently(DOCUMENT_PATH) }))?;
    Ok(())
}

fn moved_permanently(location: &'static str) -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(router: &axum::Router, path: &str) -> axum::response::Response {
        router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn router(document: &'static str) -> axum::Router {
        let mut mux = GatewayMux::new();
        register_docs(&mut mux, Bytes::from_static(document.as_bytes())).unwrap();
        mux.into_router()
    }

    #[tokio::test]
    async fn serves_document_verbatim() {
        let doc = r#"{"swagger":"2.0","paths":{"/a":{}}}"#;
        let response = get_path(&router(doc), "/swagger.json").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], doc.as_bytes());
    }

    #[tokio::test]
    async fn redirects_to_viewer_and_document() {
        let router = router("{}");

        let response = get_path(&router, "/docs").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/docs/");

        let response = get_path(&router, "/docs/swagger.json").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/swagger.json");

        let response = get_path(&router, "/docs/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&body);
        assert!(page.contains(r##"url: "/swagger.json""##));
        assert!(page.contains(r##"dom_id: "#swagger-ui""##));
        assert!(page.trim_end().ends_with("</html>"));
    }

    #[test]
    fn clashes_with_descriptor_routes() {
        let mut mux = GatewayMux::new();
        mux.route("/swagger.json", get(|| async { "mine" })).unwrap();
        assert!(matches!(
            register_docs(&mut mux, Bytes::new()),
            Err(GatewayError::DuplicateRoute(_))
        ));
    }
}
