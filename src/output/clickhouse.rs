//! ClickHouse sink with durable outbox
//!
//! Events are batched and inserted over the HTTP interface as
//! `INSERT INTO <db>.<table> (event) FORMAT JSONEachRow`, one
//! `{"event": "<json>"}` row per event. When an insert fails and the outbox
//! is enabled, the batch is spooled to disk and the request is considered
//! accepted; a drainer folded into `flush` retries the oldest spool files
//! with exponential backoff. Without the outbox, insert failures propagate
//! to the caller.

use crate::config::OutputConfig;
use crate::error::{OutputError, SpindleError};
use crate::event::Event;
use crate::output::outbox::{self, DiskOutbox};
use crate::output::{FlushLog, Writer, FLUSH_THRESHOLD};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Spool files attempted per drain pass; keeps `flush` latency bounded
/// while the backlog catches up across successive flushes.
const DRAIN_FILES_PER_FLUSH: usize = 10;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_DATABASE: &str = "default";
const DEFAULT_TABLE: &str = "spindle_events";

struct RetryState {
    next_retry_at: Option<Instant>,
    current_backoff: Duration,
}

/// Batched ClickHouse writer with optional on-disk outbox.
pub struct ClickHouseWriter {
    client: reqwest::Client,
    url: String,
    database: String,
    table: String,
    user: String,
    pass: String,
    flush_log: Option<FlushLog>,
    outbox: Option<DiskOutbox>,
    outbox_batch_size: usize,
    retry_backoff: Duration,
    retry_max: Duration,
    buf: Mutex<Vec<Event>>,
    retry: Mutex<RetryState>,
}

impl ClickHouseWriter {
    /// Build the writer from output configuration. Does not probe the
    /// server; the factory runs [`ping`](Self::ping) separately so tests
    /// can construct writers against failing backends.
    pub fn new(cfg: &OutputConfig, flush_log: Option<FlushLog>) -> Result<Self, SpindleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(OutputError::from)?;

        let database = if cfg.clickhouse_database.is_empty() {
            DEFAULT_DATABASE.to_string()
        } else {
            cfg.clickhouse_database.clone()
        };
        let table = if cfg.clickhouse_table.is_empty() {
            DEFAULT_TABLE.to_string()
        } else {
            cfg.clickhouse_table.clone()
        };

        let retry_backoff = if cfg.outbox.retry_backoff_seconds == 0 {
            DEFAULT_RETRY_BACKOFF
        } else {
            Duration::from_secs(cfg.outbox.retry_backoff_seconds)
        };
        let retry_max = if cfg.outbox.retry_max_backoff_seconds == 0 {
            DEFAULT_RETRY_MAX_BACKOFF
        } else {
            Duration::from_secs(cfg.outbox.retry_max_backoff_seconds)
        };
        let outbox_batch_size = if cfg.outbox.max_batch_size == 0 {
            FLUSH_THRESHOLD
        } else {
            cfg.outbox.max_batch_size
        };
        let outbox = if cfg.outbox.enabled {
            Some(DiskOutbox::new(
                cfg.outbox.dir.clone(),
                cfg.outbox.max_bytes.max(0) as u64,
            )?)
        } else {
            None
        };

        Ok(Self {
            client,
            url: cfg.clickhouse_url.trim_end_matches('/').to_string(),
            database,
            table,
            user: cfg.clickhouse_user.clone(),
            pass: cfg.clickhouse_password.clone(),
            flush_log,
            outbox,
            outbox_batch_size,
            retry_backoff,
            retry_max,
            buf: Mutex::new(Vec::with_capacity(FLUSH_THRESHOLD)),
            retry: Mutex::new(RetryState {
                next_retry_at: None,
                current_backoff: retry_backoff,
            }),
        })
    }

    /// Verify connectivity and credentials with `SELECT 1`.
    pub async fn ping(&self) -> Result<(), OutputError> {
        let mut request = self
            .client
            .get(format!("{}/", self.url))
            .query(&[("query", "SELECT 1")]);
        if !self.user.is_empty() || !self.pass.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.pass));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutputError::Status {
                backend: "clickhouse",
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Outbox counters, when the outbox is enabled.
    pub fn outbox_stats(&self) -> Option<outbox::OutboxStats> {
        self.outbox.as_ref().map(DiskOutbox::stats)
    }

    fn report(&self, rows: usize, err: Option<&OutputError>) {
        if let Some(log) = &self.flush_log {
            log(rows, err);
        }
    }

    async fn insert_batch(&self, batch: &[Event]) -> Result<(), OutputError> {
        let mut body = Vec::new();
        for event in batch {
            let event_json = serde_json::to_string(event)?;
            let row = serde_json::json!({ "event": event_json });
            serde_json::to_writer(&mut body, &row)?;
            body.push(b'\n');
        }
        let query = format!(
            "INSERT INTO {}.{} (event) FORMAT JSONEachRow",
            self.database, self.table
        );
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("query", query.as_str())])
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !self.user.is_empty() || !self.pass.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.pass));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutputError::Status {
                backend: "clickhouse",
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn flush_buf(&self) -> Result<(), OutputError> {
        let batch = {
            let mut buf = self.buf.lock();
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *buf, Vec::with_capacity(FLUSH_THRESHOLD))
        };

        let Err(err) = self.insert_batch(&batch).await else {
            self.report(batch.len(), None);
            return Ok(());
        };

        let Some(outbox) = &self.outbox else {
            self.report(batch.len(), Some(&err));
            return Err(err);
        };

        // the batch has left the buffer; durability now depends on the spool
        let mut dropped = 0;
        for chunk in batch.chunks(self.outbox_batch_size) {
            match outbox.enqueue(chunk) {
                Ok(d) => dropped += d,
                Err(enqueue_err) => {
                    self.report(batch.len(), Some(&enqueue_err));
                    return Err(enqueue_err);
                }
            }
        }
        let stats = outbox.stats();
        let diag = OutputError::Spooled {
            dropped,
            files: stats.files,
            bytes: stats.bytes,
            source: Box::new(err),
        };
        self.report(batch.len(), Some(&diag));
        Ok(())
    }

    async fn drain_outbox(&self) -> Result<(), OutputError> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };
        {
            let retry = self.retry.lock();
            if let Some(at) = retry.next_retry_at {
                if Instant::now() < at {
                    return Ok(());
                }
            }
        }
        for _ in 0..DRAIN_FILES_PER_FLUSH {
            let Some(meta) = outbox.oldest_meta() else {
                let mut retry = self.retry.lock();
                retry.current_backoff = self.retry_backoff;
                retry.next_retry_at = None;
                return Ok(());
            };
            let batch = match outbox::read_batch(&meta.path) {
                Ok(batch) => batch,
                Err(err) => {
                    outbox.discard(&meta);
                    self.report(
                        meta.events,
                        Some(&OutputError::SpoolUnreadable {
                            name: meta.name.clone(),
                            source: Box::new(err),
                        }),
                    );
                    continue;
                }
            };
            if let Err(err) = self.insert_batch(&batch).await {
                self.report(batch.len(), Some(&err));
                let mut retry = self.retry.lock();
                retry.next_retry_at = Some(Instant::now() + retry.current_backoff);
                retry.current_backoff = (retry.current_backoff * 2).min(self.retry_max);
                return Ok(());
            }
            if let Err(err) = outbox.remove(&meta.name) {
                self.report(batch.len(), Some(&err));
            }
            self.report(batch.len(), None);
            let mut retry = self.retry.lock();
            retry.current_backoff = self.retry_backoff;
            retry.next_retry_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for ClickHouseWriter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write(&self, event: Event) -> Result<(), OutputError> {
        let should_flush = {
            let mut buf = self.buf.lock();
            buf.push(event);
            buf.len() >= FLUSH_THRESHOLD
        };
        if should_flush {
            return self.flush().await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.flush_buf().await?;
        self.drain_outbox().await
    }
}
