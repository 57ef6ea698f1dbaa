//! twinport demo server.
//!
//! Hosts the standard gRPC health service and a small JSON gateway in
//! front of it.
//!
//! ```text
//!                 ┌──────────────── one TCP port ────────────────┐
//!                 │                                               │
//!   gRPC client ──┼─▶ mux ──(HTTP/2 preface)──▶ tonic ─▶ Health  │
//!                 │    │                                          │
//!   HTTP client ──┼────┴──(anything else)────▶ axum ─▶ /v1/health│
//!                 │                                   /swagger.json
//!                 │                                   /docs       │
//!                 └───────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use axum::extract::Query;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::{HealthCheckRequest, FILE_DESCRIPTOR_SET};
use tower_http::set_header::SetResponseHeaderLayer;

use twinport::config::{load_config, ServerConfig};
use twinport::net::ListenerSet;
use twinport::observability::logging::init_logging;
use twinport::transport::{Next, RpcCall, ServiceDesc};
use twinport::Server;

const HEALTH_DOCUMENT: &str = r##"{
  "swagger": "2.0",
  "info": {"title": "twinport health", "version": "1.0"},
  "paths": {
    "/v1/health": {
      "get": {
        "operationId": "Health_Check",
        "responses": {"200": {"schema": {"$ref": "#/definitions/HealthStatus"}}}
      }
    }
  },
  "definitions": {
    "HealthStatus": {
      "type": "object",
      "properties": {"status": {"type": "string"}}
    }
  }
}"##;

#[derive(Parser)]
#[command(name = "twinport")]
#[command(about = "gRPC and HTTP/JSON gateway on one port", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the RPC port.
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Override the gateway port. Equal to the RPC port means shared.
    #[arg(long)]
    gateway_port: Option<u16>,

    /// Emit JSON logs.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.rpc_port {
        config.listener.rpc_port = port;
    }
    if let Some(port) = cli.gateway_port {
        config.listener.gateway_port = Some(port);
    }
    config.observability.json |= cli.json;

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        host = %config.listener.host,
        rpc_port = config.listener.rpc_port,
        gateway_port = ?config.listener.gateway_port,
        "twinport v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let listeners = match ListenerSet::bind(&config.listener, &config.sniff).await {
        Ok(listeners) => listeners,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind listeners");
            return ExitCode::FAILURE;
        }
    };

    // The gateway reaches the gRPC service like any other client would.
    let channel = match Endpoint::from_shared(local_target(listeners.rpc_addr())) {
        Ok(endpoint) => endpoint.connect_lazy(),
        Err(e) => {
            tracing::error!(error = %e, "Invalid gRPC endpoint");
            return ExitCode::FAILURE;
        }
    };

    let (_reporter, health) = tonic_health::server::health_reporter();
    let desc = ServiceDesc::new(health)
        .with_gateway(move |mux| {
            let client = HealthClient::new(channel.clone());
            mux.route(
                "/v1/health",
                get(move |Query(query): Query<HealthQuery>| {
                    check_health(client.clone(), query.service)
                }),
            )?;
            Ok(())
        })
        .with_document(HEALTH_DOCUMENT)
        .with_file_descriptor_set(FILE_DESCRIPTOR_SET);

    let server = Server::new(config)
        .with_listeners(listeners)
        .with_span(tracing::info_span!("twinport"))
        .with_http_layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(concat!("twinport/", env!("CARGO_PKG_VERSION"))),
        ))
        .with_interceptor(|call: RpcCall, next: Next| async move {
            let method = call.method().to_string();
            let started = std::time::Instant::now();
            let response = next.run(call).await;
            tracing::info!(
                method = %method,
                grpc_status = ?response.headers().get("grpc-status"),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "gRPC call"
            );
            response
        });

    match server.run(desc).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server exited with error");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    #[serde(default)]
    service: String,
}

/// `GET /v1/health?service=name` → `grpc.health.v1.Health/Check`.
async fn check_health(mut client: HealthClient<Channel>, service: String) -> Response {
    match client.check(HealthCheckRequest { service }).await {
        Ok(response) => {
            let status = ServingStatus::try_from(response.into_inner().status)
                .map(|s| s.as_str_name())
                .unwrap_or("UNKNOWN");
            Json(json!({ "status": status })).into_response()
        }
        Err(status) => {
            let code = match status.code() {
                tonic::Code::NotFound => StatusCode::NOT_FOUND,
                tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (code, Json(json!({ "error": status.message() }))).into_response()
        }
    }
}

/// URL a local client reaches `addr` on. Wildcard binds are reached over
/// loopback.
fn local_target(addr: SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}
