//! Output sinks for enriched events
//!
//! Every sink presents the same contract: per-event enqueue, caller-driven
//! flush, and close. The ClickHouse sink adds a durable on-disk outbox so a
//! failing analytics store does not lose accepted batches.

pub mod clickhouse;
pub mod elasticsearch;
pub mod outbox;
pub mod stdout;

use crate::config::OutputConfig;
use crate::error::{OutputError, Result, SpindleError};
use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;

pub use clickhouse::ClickHouseWriter;
pub use elasticsearch::ElasticsearchWriter;
pub use outbox::{DiskOutbox, OutboxStats, SpoolFileMeta};
pub use stdout::StdoutWriter;

/// Buffered sinks deliver once this many events are queued.
pub const FLUSH_THRESHOLD: usize = 100;

/// Called after each ClickHouse flush attempt with the row count and the
/// outcome. Used by the assembly root for logging; never sees raw events.
pub type FlushLog = Arc<dyn Fn(usize, Option<&OutputError>) + Send + Sync>;

/// Writer trait - delivers enriched events to a destination
///
/// `write` may trigger delivery when the batch threshold is hit; the caller
/// bears the cost of that flush, which is the admitted backpressure
/// mechanism. Concurrent `write` and `flush` calls are safe: a flush drains
/// the snapshot it took, not subsequent arrivals.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Writer name for identification and logging
    fn name(&self) -> &'static str;

    /// Enqueue one event for delivery
    async fn write(&self, event: Event) -> std::result::Result<(), OutputError>;

    /// Deliver the current buffer and, for the durable sink, attempt an
    /// outbox drain pass
    async fn flush(&self) -> std::result::Result<(), OutputError>;

    /// Flush and release resources
    async fn close(&self) -> std::result::Result<(), OutputError> {
        self.flush().await
    }
}

impl std::fmt::Debug for dyn Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("name", &self.name()).finish()
    }
}

/// Elasticsearch index used when none is configured.
const DEFAULT_ES_INDEX: &str = "spindle-events";

/// Build the configured sink. The ClickHouse probe runs here so a dead
/// analytics store fails startup instead of the first batch.
pub async fn make_writer(
    cfg: &OutputConfig,
    flush_log: Option<FlushLog>,
) -> Result<Arc<dyn Writer>> {
    match cfg.r#type.as_str() {
        "stdout" => Ok(Arc::new(StdoutWriter::new())),
        "elasticsearch" => {
            if cfg.elasticsearch_url.is_empty() {
                return Err(SpindleError::Config(
                    "elasticsearch_url required".to_string(),
                ));
            }
            let index = if cfg.elasticsearch_index.is_empty() {
                DEFAULT_ES_INDEX
            } else {
                &cfg.elasticsearch_index
            };
            Ok(Arc::new(ElasticsearchWriter::new(
                &cfg.elasticsearch_url,
                index,
                &cfg.elasticsearch_user,
                &cfg.elasticsearch_pass,
            )?))
        }
        "clickhouse" => {
            if cfg.clickhouse_url.is_empty() {
                return Err(SpindleError::Config("clickhouse_url required".to_string()));
            }
            let writer = ClickHouseWriter::new(cfg, flush_log)?;
            if !cfg.skip_clickhouse_ping {
                writer.ping().await.map_err(|e| {
                    SpindleError::Config(format!("clickhouse connection check failed: {e}"))
                })?;
            }
            Ok(Arc::new(writer))
        }
        other => Err(SpindleError::Config(format!("unknown output type: {other}"))),
    }
}
