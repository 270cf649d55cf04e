//! End-to-end tests for the ingest API
//!
//! Drives a real listener with an HTTP client and checks the admission
//! pipeline and the line-sink output against the documented contract.

use parking_lot::Mutex;
use serde_json::{json, Value};
use spindle::auth::Validator;
use spindle::enrich::Enricher;
use spindle::ingest::{IngestLimits, IngestState, ProcessBatch};
use spindle::output::{StdoutWriter, Writer};
use spindle::ratelimit::PerSensorLimiter;
use spindle::server;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared in-memory sink standing in for stdout.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn spip_style_event() -> Value {
    json!({
        "@timestamp": "2025-02-15T12:00:00Z",
        "event": { "id": "test-1", "ingested_by": "spip" },
        "source": { "ip": "8.8.8.8", "port": 12345 },
        "destination": { "ip": "127.0.0.1", "port": 8080 },
    })
}

/// Ingest state with a line sink writing into the returned buffer.
fn make_state(limiter: PerSensorLimiter) -> (IngestState, SharedBuf) {
    let buf = SharedBuf::default();
    let writer: Arc<dyn Writer> =
        Arc::new(StdoutWriter::with_sink(Box::new(buf.clone())));
    let enricher = Arc::new(Enricher::new("", "", None).unwrap());

    let process: ProcessBatch = {
        let writer = Arc::clone(&writer);
        let enricher = Arc::clone(&enricher);
        Arc::new(move |_sensor_id, events| {
            let writer = Arc::clone(&writer);
            let enricher = Arc::clone(&enricher);
            Box::pin(async move {
                for mut event in events {
                    enricher.enrich(&mut event).await;
                    writer.write(event).await?;
                }
                Ok(())
            })
        })
    };

    let mut tokens = HashMap::new();
    tokens.insert("test-token".to_string(), "spip-001".to_string());

    let state = IngestState {
        validator: Arc::new(Validator::new(&tokens)),
        limiter: Arc::new(limiter),
        limits: IngestLimits {
            max_body_bytes: 1024 * 1024,
            max_events: 500,
            max_event_bytes: 128 * 1024,
        },
        process,
        metrics: None,
    };
    (state, buf)
}

async fn start_server(state: IngestState) -> SocketAddr {
    let app = server::ingest_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn ingest_request(
    client: &reqwest::Client,
    addr: SocketAddr,
    path: &str,
    body: String,
) -> reqwest::RequestBuilder {
    client
        .post(format!("http://{addr}{path}"))
        .header("Content-Type", "application/json")
        .header("Authorization", "Bearer test-token")
        .header("X-Spip-ID", "spip-001")
        .body(body)
}

#[tokio::test]
async fn test_happy_path_emits_one_json_line() {
    let (state, buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let body = json!([spip_style_event()]).to_string();
    let response = ingest_request(&client, addr, "/ingest", body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert_eq!(response.text().await.unwrap(), "");

    let output = String::from_utf8(buf.0.lock().clone()).unwrap();
    assert_eq!(output.lines().count(), 1);
    let emitted: Value = serde_json::from_str(output.trim_end()).unwrap();
    assert_eq!(emitted["@timestamp"], json!("2025-02-15T12:00:00Z"));
    assert_eq!(emitted["event"]["id"], json!("test-1"));
    assert_eq!(emitted["source"]["ip"], json!("8.8.8.8"));
    assert_eq!(emitted["destination"]["port"], json!(8080));
}

#[tokio::test]
async fn test_all_three_ingest_routes_are_equivalent() {
    let (state, buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    for path in ["/", "/ingest", "/api/v1/ingest"] {
        let body = json!([spip_style_event()]).to_string();
        let response = ingest_request(&client, addr, path, body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204, "path {path}");
    }
    let output = String::from_utf8(buf.0.lock().clone()).unwrap();
    assert_eq!(output.lines().count(), 3);
}

#[tokio::test]
async fn test_wrong_header_sensor_is_unauthorized() {
    let (state, _buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/ingest"))
        .header("Content-Type", "application/json")
        .header("Authorization", "Bearer test-token")
        .header("X-Spip-ID", "other-sensor")
        .body(json!([spip_style_event()]).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"unauthorized\"}"
    );
}

#[tokio::test]
async fn test_wrong_content_type_is_rejected() {
    let (state, _buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/ingest"))
        .header("Content-Type", "text/plain")
        .header("Authorization", "Bearer test-token")
        .header("X-Spip-ID", "spip-001")
        .body(json!([spip_style_event()]).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 415);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"invalid_content_type\"}"
    );
}

#[tokio::test]
async fn test_non_array_body_is_invalid() {
    let (state, _buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let response = ingest_request(&client, addr, "/ingest", "{\"a\":1}".to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"invalid_request\"}"
    );
}

#[tokio::test]
async fn test_oversize_batch_is_rejected() {
    let (mut state, _buf) = make_state(PerSensorLimiter::new(100));
    state.limits.max_events = 2;
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let body = json!([
        spip_style_event(),
        spip_style_event(),
        spip_style_event(),
    ])
    .to_string();
    let response = ingest_request(&client, addr, "/ingest", body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"batch_too_large\"}"
    );
}

#[tokio::test]
async fn test_third_request_in_window_is_rate_limited() {
    // fixed clock keeps all three requests inside one window
    let (state, _buf) = make_state(PerSensorLimiter::with_clock(2, || 1_000));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = ingest_request(
            &client,
            addr,
            "/ingest",
            json!([spip_style_event()]).to_string(),
        )
        .send()
        .await
        .unwrap();
        assert_eq!(response.status(), 204);
    }

    let response = ingest_request(
        &client,
        addr,
        "/ingest",
        json!([spip_style_event()]).to_string(),
    )
    .send()
    .await
    .unwrap();

    assert_eq!(response.status(), 429);
    assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"rate_limit_exceeded\"}"
    );
}

#[tokio::test]
async fn test_unknown_method_gets_json_error() {
    let (state, _buf) = make_state(PerSensorLimiter::new(100));
    let addr = start_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/ingest"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 405);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"error\":\"method_not_allowed\"}"
    );
}
