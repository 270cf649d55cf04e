//! Ingest request handling
//!
//! One handler implements the whole admission pipeline: method and
//! content-type checks, bearer-token authentication, sensor-header match,
//! per-sensor rate limiting, bounded body read, batch shape and size
//! checks, then per-event dispatch to the injected batch processor. The
//! handler is the only place that converts errors into HTTP statuses.

pub mod metrics;

use crate::auth::Validator;
use crate::event::{self, Event};
use crate::ratelimit::PerSensorLimiter;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info};

pub use metrics::IngestMetrics;

/// Processes one admitted batch (enrich + write by default). Supplied by
/// the assembly root; an error fails the whole batch.
pub type ProcessBatch = Arc<
    dyn Fn(String, Vec<Event>) -> Pin<Box<dyn Future<Output = crate::error::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Admission caps for one request.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_body_bytes: usize,
    pub max_events: usize,
    pub max_event_bytes: usize,
}

/// Shared state behind the ingest routes.
#[derive(Clone)]
pub struct IngestState {
    pub validator: Arc<Validator>,
    pub limiter: Arc<PerSensorLimiter>,
    pub limits: IngestLimits,
    pub process: ProcessBatch,
    pub metrics: Option<Arc<IngestMetrics>>,
}

impl IngestState {
    fn observe(&self, sensor_id: &str, status: StatusCode) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_requests(sensor_id, status.as_u16());
        }
    }

    fn observe_events(&self, sensor_id: &str, n: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.add_events(sensor_id, n);
        }
    }
}

/// Handle a POST of a JSON array of events.
pub async fn handle_ingest(State(state): State<IngestState>, req: Request) -> Response {
    if req.method() != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed");
    }
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;

    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        != Some("application/json")
    {
        return error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid_content_type");
    }

    let Some(token) = bearer_token(headers) else {
        state.observe("unknown", StatusCode::UNAUTHORIZED);
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    };
    let Some(sensor_id) = state.validator.validate(token) else {
        state.observe("unknown", StatusCode::UNAUTHORIZED);
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    };

    // X-Spip-ID, when present, must match the sensor bound to the token
    if let Some(header_id) = headers.get("x-spip-id").and_then(|v| v.to_str().ok()) {
        if !header_id.is_empty() && header_id != sensor_id {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    if !state.limiter.allow(&sensor_id) {
        state.observe(&sensor_id, StatusCode::TOO_MANY_REQUESTS);
        return rate_limited_response(state.limiter.retry_after_seconds());
    }

    let body = match axum::body::to_bytes(body, state.limits.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            if is_length_limit(&err) {
                state.observe(&sensor_id, StatusCode::PAYLOAD_TOO_LARGE);
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large");
            }
            debug!(sensor_id, error = %err, "read body");
            state.observe(&sensor_id, StatusCode::BAD_REQUEST);
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
    };

    // the body must be a JSON array of objects
    if body.trim_ascii().first() != Some(&b'[') {
        state.observe(&sensor_id, StatusCode::BAD_REQUEST);
        return error_response(StatusCode::BAD_REQUEST, "invalid_request");
    }
    let values: Vec<Value> = match serde_json::from_slice(&body) {
        Ok(values) => values,
        Err(err) => {
            debug!(sensor_id, error = %err, "parse batch");
            state.observe(&sensor_id, StatusCode::BAD_REQUEST);
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
    };
    if values.len() > state.limits.max_events {
        state.observe(&sensor_id, StatusCode::PAYLOAD_TOO_LARGE);
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "batch_too_large");
    }
    let mut events = Vec::with_capacity(values.len());
    for value in values {
        let Value::Object(event) = value else {
            state.observe(&sensor_id, StatusCode::BAD_REQUEST);
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        };
        if event::encoded_len(&event) > state.limits.max_event_bytes {
            state.observe(&sensor_id, StatusCode::PAYLOAD_TOO_LARGE);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "event_too_large");
        }
        events.push(event);
    }

    let count = events.len();
    state.observe(&sensor_id, StatusCode::OK);
    state.observe_events(&sensor_id, count);

    if let Err(err) = (state.process)(sensor_id.clone(), events).await {
        error!(sensor_id, error = %err, "process batch");
        state.observe(&sensor_id, StatusCode::INTERNAL_SERVER_ERROR);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
    }

    info!(sensor_id, events = count, "ingest batch ok");
    StatusCode::NO_CONTENT.into_response()
}

/// Extract the token from a case-insensitive `Bearer ` authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 7 || !value[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = value[7..].trim();
    (!token.is_empty()).then_some(token)
}

/// True when the body read failed because the length cap was hit.
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn error_response(status: StatusCode, slug: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        format!("{{\"error\":\"{slug}\"}}"),
    )
        .into_response()
}

fn rate_limited_response(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::RETRY_AFTER, retry_after.to_string()),
        ],
        "{\"error\":\"rate_limit_exceeded\"}",
    )
        .into_response()
}
