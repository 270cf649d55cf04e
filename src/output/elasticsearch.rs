//! Elasticsearch bulk sink
//!
//! Buffers events in memory and delivers them as a single `_bulk` request
//! of action/document NDJSON pairs. The buffer is snapshotted and swapped
//! under the mutex before the network call, so concurrent writes are never
//! blocked on delivery.

use crate::error::OutputError;
use crate::event::Event;
use crate::output::{Writer, FLUSH_THRESHOLD};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Batches events and POSTs them to the Elasticsearch bulk API.
pub struct ElasticsearchWriter {
    client: reqwest::Client,
    url: String,
    index: String,
    user: String,
    pass: String,
    buf: Mutex<Vec<Event>>,
}

impl ElasticsearchWriter {
    /// Create a bulk writer for `<base_url>/_bulk` indexing into `index`.
    pub fn new(
        base_url: &str,
        index: &str,
        user: &str,
        pass: &str,
    ) -> Result<Self, OutputError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/_bulk", base_url.trim_end_matches('/')),
            index: index.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
            buf: Mutex::new(Vec::with_capacity(FLUSH_THRESHOLD)),
        })
    }

    async fn flush_buf(&self) -> Result<(), OutputError> {
        let batch = {
            let mut buf = self.buf.lock();
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *buf, Vec::with_capacity(FLUSH_THRESHOLD))
        };

        let mut body = Vec::new();
        let action = json!({ "index": { "_index": self.index } });
        for event in &batch {
            serde_json::to_writer(&mut body, &action)?;
            body.push(b'\n');
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if !self.user.is_empty() && !self.pass.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.pass));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutputError::Status {
                backend: "elasticsearch",
                status: status.as_u16(),
                body,
            });
        }
        debug!(count = batch.len(), index = %self.index, "bulk delivered");
        Ok(())
    }
}

#[async_trait]
impl Writer for ElasticsearchWriter {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn write(&self, event: Event) -> Result<(), OutputError> {
        let should_flush = {
            let mut buf = self.buf.lock();
            buf.push(event);
            buf.len() >= FLUSH_THRESHOLD
        };
        if should_flush {
            return self.flush_buf().await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.flush_buf().await
    }
}
