//! Prometheus metrics for the ingest API
//!
//! Labels never include tokens, IPs, or free-form strings; sensor IDs are
//! allowed, and status codes are normalized to a small closed set.

use crate::error::{Result, SpindleError};
use prometheus::{CounterVec, Opts, Registry};

/// Request and event counters for the ingest API.
pub struct IngestMetrics {
    requests_total: CounterVec,
    events_total: CounterVec,
}

impl IngestMetrics {
    /// Create and register ingest metrics on the given registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = CounterVec::new(
            Opts::new(
                "spindle_ingest_requests_total",
                "Total ingest requests by sensor and status",
            ),
            &["sensor_id", "status"],
        )
        .map_err(|e| SpindleError::Metrics(format!("requests_total: {e}")))?;
        let events_total = CounterVec::new(
            Opts::new(
                "spindle_ingest_events_total",
                "Total events received by sensor",
            ),
            &["sensor_id"],
        )
        .map_err(|e| SpindleError::Metrics(format!("events_total: {e}")))?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| SpindleError::Metrics(format!("requests_total: {e}")))?;
        registry
            .register(Box::new(events_total.clone()))
            .map_err(|e| SpindleError::Metrics(format!("events_total: {e}")))?;

        Ok(Self {
            requests_total,
            events_total,
        })
    }

    pub fn inc_requests(&self, sensor_id: &str, status: u16) {
        self.requests_total
            .with_label_values(&[sensor_id, normalize_status(status)])
            .inc();
    }

    pub fn add_events(&self, sensor_id: &str, n: usize) {
        self.events_total
            .with_label_values(&[sensor_id])
            .inc_by(n as f64);
    }
}

/// Map a status code onto the closed label set.
fn normalize_status(code: u16) -> &'static str {
    match code {
        200 => "200",
        204 => "204",
        400 => "400",
        401 => "401",
        413 => "413",
        429 => "429",
        500 => "500",
        503 => "503",
        _ => "other",
    }
}
