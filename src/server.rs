//! HTTP transport
//!
//! Two listeners: the ingest API (three equivalent POST routes, optionally
//! TLS) and a management listener with liveness, readiness, and metrics
//! endpoints. Shutdown is graceful with separate deadlines for each
//! listener.

use crate::error::{Result, SpindleError};
use crate::ingest::{handle_ingest, IngestState};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Close the connection if a client has not sent its request headers
/// within this window.
const CLIENT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// In-flight ingest requests get this long to finish on shutdown.
const INGEST_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

const MANAGEMENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness predicate consulted by `/ready`.
pub type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// TLS material paths; presence enables HTTPS on the ingest listener.
pub struct TlsPaths {
    pub cert_file: String,
    pub key_file: String,
}

/// State behind the management routes.
#[derive(Clone)]
pub struct ManagementState {
    pub enricher_ready: ReadyCheck,
    pub output_ready: ReadyCheck,
    /// Present when metrics are enabled; mounts `/metrics`.
    pub registry: Option<Registry>,
}

/// Runs the ingest API and optional management listener.
pub struct Server {
    pub listen_addr: SocketAddr,
    pub management_addr: Option<SocketAddr>,
    pub tls: Option<TlsPaths>,
    pub ingest: IngestState,
    pub management: ManagementState,
}

/// The ingest router: all methods dispatch into the handler, which answers
/// 405 itself so the error body matches the slug taxonomy.
pub fn ingest_router(state: IngestState) -> Router {
    Router::new()
        .route("/", any(handle_ingest))
        .route("/ingest", any(handle_ingest))
        .route("/api/v1/ingest", any(handle_ingest))
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

pub fn management_router(state: ManagementState) -> Router {
    let mut router = Router::new()
        .route("/health", get(serve_liveness))
        .route("/live", get(serve_liveness))
        .route("/ready", get(serve_readiness));
    if state.registry.is_some() {
        router = router.route("/metrics", get(serve_metrics));
    }
    router.with_state(state)
}

impl Server {
    /// Serve until the shutdown future resolves, then drain gracefully.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let ingest_handle = Handle::new();
        let management_handle = Handle::new();

        if let Some(addr) = self.management_addr {
            let router = management_router(self.management.clone());
            let handle = management_handle.clone();
            tokio::spawn(async move {
                info!(%addr, "management server listening");
                if let Err(e) = axum_server::bind(addr)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                {
                    error!(error = %e, "management server");
                }
            });
        }

        {
            let ingest_handle = ingest_handle.clone();
            let management_handle = management_handle.clone();
            tokio::spawn(async move {
                shutdown.await;
                info!("shutting down HTTP servers");
                ingest_handle.graceful_shutdown(Some(INGEST_SHUTDOWN_TIMEOUT));
                management_handle.graceful_shutdown(Some(MANAGEMENT_SHUTDOWN_TIMEOUT));
            });
        }

        let app = ingest_router(self.ingest);
        match self.tls {
            Some(tls) => {
                let config = RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                    .await
                    .map_err(|e| SpindleError::Config(format!("load TLS materials: {e}")))?;
                info!(addr = %self.listen_addr, "ingest server (HTTPS) listening");
                let mut server = axum_server::bind_rustls(self.listen_addr, config)
                    .handle(ingest_handle);
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(CLIENT_HEADER_TIMEOUT);
                server.serve(app.into_make_service()).await?;
            }
            None => {
                info!(addr = %self.listen_addr, "ingest server listening (no TLS)");
                let mut server = axum_server::bind(self.listen_addr).handle(ingest_handle);
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(CLIENT_HEADER_TIMEOUT);
                server.serve(app.into_make_service()).await?;
            }
        }
        Ok(())
    }
}

/// Request log line; never includes bodies or tokens.
async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();
    let response = next.run(req).await;
    debug!(
        %method,
        path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn serve_liveness() -> &'static str {
    "ok"
}

async fn serve_readiness(State(state): State<ManagementState>) -> Response {
    if !(state.enricher_ready)() {
        return (StatusCode::SERVICE_UNAVAILABLE, "enricher not ready").into_response();
    }
    if !(state.output_ready)() {
        return (StatusCode::SERVICE_UNAVAILABLE, "output not ready").into_response();
    }
    (StatusCode::OK, "ok").into_response()
}

async fn serve_metrics(State(state): State<ManagementState>) -> Response {
    let Some(registry) = &state.registry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&registry.gather(), &mut buf).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buf,
    )
        .into_response()
}
