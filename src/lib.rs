//! Spindle - authenticated ingest and enrichment gateway
//!
//! Sensors POST batches of JSON events; Spindle authenticates each batch
//! against a per-sensor credential, rate-limits and bounds it, enriches
//! every event with ASN/geo/reverse-DNS data derived from `source.ip`, and
//! delivers the result to one of several sinks:
//!
//! ```text
//! Sensors ──► Admission (auth, limits) ──► Enricher ──► Writer ──► Sink
//!                                                         │
//!                                                         └─► Outbox (disk)
//! ```
//!
//! The ClickHouse sink is backed by a durable on-disk outbox: failed
//! batches are spooled and drained with backoff, bounded by total bytes
//! with drop-oldest overflow. Delivery is at-least-once.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod auth;
pub mod config;
pub mod enrich;
pub mod error;
pub mod event;
pub mod ingest;
pub mod output;
pub mod ratelimit;
pub mod server;

pub use auth::Validator;
pub use config::Config;
pub use enrich::{DnsEnricher, Enricher};
pub use error::{OutputError, Result, SpindleError};
pub use event::Event;
pub use ingest::{IngestLimits, IngestMetrics, IngestState, ProcessBatch};
pub use output::{make_writer, DiskOutbox, FlushLog, Writer};
pub use ratelimit::PerSensorLimiter;
pub use server::{ManagementState, ReadyCheck, Server, TlsPaths};
