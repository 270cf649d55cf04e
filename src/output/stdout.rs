//! Stdout line sink
//!
//! Serializes each event as one JSON line to buffered standard output.
//! Writes are immediate (no batching) and serialized by a single mutex.

use crate::error::OutputError;
use crate::event::Event;
use crate::output::Writer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::{BufWriter, Write};

/// Writes one JSON line per event to stdout.
pub struct StdoutWriter {
    out: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl StdoutWriter {
    pub fn new() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    /// Redirect output to an arbitrary sink (used by tests).
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(BufWriter::new(sink)),
        }
    }
}

impl Default for StdoutWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Writer for StdoutWriter {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&self, event: Event) -> Result<(), OutputError> {
        let line = serde_json::to_vec(&event)?;
        let mut out = self.out.lock();
        out.write_all(&line)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.out.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Shared in-memory sink so the test can inspect what was written.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn make_event() -> Event {
        let Value::Object(event) = json!({
            "@timestamp": "2026-02-15T19:47:09Z",
            "event": { "id": "abc", "ingested_by": "spip" },
            "source": { "ip": "8.8.8.8", "port": 12345 },
        }) else {
            panic!("not an object");
        };
        event
    }

    #[tokio::test]
    async fn test_write_emits_one_json_line() {
        let buf = SharedBuf::default();
        let writer = StdoutWriter::with_sink(Box::new(buf.clone()));

        writer.write(make_event()).await.unwrap();
        writer.close().await.unwrap();

        let output = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(output.lines().count(), 1);
        let decoded: Value = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(decoded["@timestamp"], json!("2026-02-15T19:47:09Z"));
        assert_eq!(decoded["source"]["ip"], json!("8.8.8.8"));
        assert_eq!(decoded["event"]["ingested_by"], json!("spip"));
    }

    #[tokio::test]
    async fn test_write_flushes_immediately() {
        let buf = SharedBuf::default();
        let writer = StdoutWriter::with_sink(Box::new(buf.clone()));

        writer.write(make_event()).await.unwrap();
        // visible without an explicit flush
        assert!(!buf.0.lock().is_empty());
    }
}
