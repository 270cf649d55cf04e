//! Durable on-disk outbox for failed analytics batches
//!
//! Each spool file is one batch, NDJSON-encoded, written atomically via a
//! `.tmp` sibling and rename. File names sort lexicographically in enqueue
//! order; total size is bounded by deleting oldest files first, but the
//! single oldest file is never sacrificed, so overflow cannot empty the
//! queue entirely. The directory is a private contract: the service may
//! delete or rewrite files at will.

use crate::error::OutputError;
use crate::event::Event;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata for one spool file.
#[derive(Debug, Clone)]
pub struct SpoolFileMeta {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub events: usize,
}

/// Outbox counters for observability.
#[derive(Debug, Clone, Copy)]
pub struct OutboxStats {
    pub files: usize,
    pub bytes: u64,
    pub dropped_events: u64,
}

struct OutboxState {
    files: Vec<SpoolFileMeta>,
    total_bytes: u64,
    seq: u64,
    dropped_events: u64,
}

/// NDJSON file spool, bounded by total bytes with drop-oldest overflow.
pub struct DiskOutbox {
    dir: PathBuf,
    /// 0 disables the cap
    max_bytes: u64,
    state: Mutex<OutboxState>,
}

impl DiskOutbox {
    /// Open (and create if needed) the spool directory and reload any
    /// batches left behind by a previous run.
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, OutputError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let outbox = Self {
            dir,
            max_bytes,
            state: Mutex::new(OutboxState {
                files: Vec::new(),
                total_bytes: 0,
                seq: 0,
                dropped_events: 0,
            }),
        };
        outbox.reload()?;
        Ok(outbox)
    }

    fn reload(&self) -> Result<(), OutputError> {
        let mut files = Vec::new();
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !name.ends_with(".ndjson") || file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(events) = count_ndjson_lines(&path) else {
                continue;
            };
            total += meta.len();
            files.push(SpoolFileMeta {
                name,
                path,
                size: meta.len(),
                events,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        let mut state = self.state.lock();
        state.files = files;
        state.total_bytes = total;
        Ok(())
    }

    /// Serialize a batch to a new spool file and enforce the byte cap.
    /// Returns the number of events dropped from older files to make room.
    pub fn enqueue(&self, batch: &[Event]) -> Result<usize, OutputError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut body = Vec::new();
        for event in batch {
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
        }

        let mut state = self.state.lock();
        state.seq += 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let name = format!("{:020}-{:06}.ndjson", nanos, state.seq);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let path = self.dir.join(&name);
        fs::write(&tmp, &body)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        let size = body.len() as u64;
        state.files.push(SpoolFileMeta {
            name,
            path,
            size,
            events: batch.len(),
        });
        state.files.sort_by(|a, b| a.name.cmp(&b.name));
        state.total_bytes += size;
        Ok(enforce_max_bytes(&mut state, self.max_bytes))
    }

    /// Peek the oldest spool file without removing it.
    pub fn oldest_meta(&self) -> Option<SpoolFileMeta> {
        self.state.lock().files.first().cloned()
    }

    /// Delete a spool file after successful delivery.
    pub fn remove(&self, name: &str) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        let Some(idx) = state.files.iter().position(|f| f.name == name) else {
            return Ok(());
        };
        let meta = state.files.remove(idx);
        state.total_bytes = state.total_bytes.saturating_sub(meta.size);
        fs::remove_file(&meta.path)?;
        Ok(())
    }

    /// Delete a spool file that could not be delivered or parsed, counting
    /// its events as dropped.
    pub fn discard(&self, meta: &SpoolFileMeta) {
        let mut state = self.state.lock();
        if let Some(idx) = state.files.iter().position(|f| f.name == meta.name) {
            let removed = state.files.remove(idx);
            state.total_bytes = state.total_bytes.saturating_sub(removed.size);
        }
        state.dropped_events += meta.events as u64;
        let _ = fs::remove_file(&meta.path);
    }

    /// Consistent snapshot of file count, total bytes, and dropped events.
    pub fn stats(&self) -> OutboxStats {
        let state = self.state.lock();
        OutboxStats {
            files: state.files.len(),
            bytes: state.total_bytes,
            dropped_events: state.dropped_events,
        }
    }
}

fn enforce_max_bytes(state: &mut OutboxState, max_bytes: u64) -> usize {
    if max_bytes == 0 {
        return 0;
    }
    let mut dropped = 0;
    while state.total_bytes > max_bytes && state.files.len() > 1 {
        let oldest = state.files.remove(0);
        state.total_bytes = state.total_bytes.saturating_sub(oldest.size);
        state.dropped_events += oldest.events as u64;
        dropped += oldest.events;
        let _ = fs::remove_file(&oldest.path);
    }
    dropped
}

/// Parse one spool file back into a batch. Blank lines are skipped.
pub fn read_batch(path: &Path) -> Result<Vec<Event>, OutputError> {
    let data = fs::read_to_string(path)?;
    let mut batch = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        batch.push(serde_json::from_str(line)?);
    }
    Ok(batch)
}

fn count_ndjson_lines(path: &Path) -> Result<usize, OutputError> {
    let data = fs::read_to_string(path)?;
    Ok(data.lines().filter(|line| !line.trim().is_empty()).count())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn make_event(id: &str, padding: usize) -> Event {
        let Value::Object(event) = json!({
            "event": { "id": id, "summary": "A".repeat(padding) },
        }) else {
            panic!("not an object");
        };
        event
    }

    fn disk_total(dir: &Path) -> u64 {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().metadata().unwrap().len())
            .sum()
    }

    #[test]
    fn test_enqueue_writes_one_file_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();

        let dropped = outbox
            .enqueue(&[make_event("e1", 0), make_event("e2", 0)])
            .unwrap();
        assert_eq!(dropped, 0);

        let stats = outbox.stats();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, disk_total(dir.path()));

        let meta = outbox.oldest_meta().unwrap();
        assert_eq!(meta.events, 2);
        assert!(meta.name.ends_with(".ndjson"));
    }

    #[test]
    fn test_total_bytes_tracks_disk_after_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();

        for i in 0..5 {
            outbox.enqueue(&[make_event(&format!("e{i}"), 16)]).unwrap();
        }
        let stats = outbox.stats();
        assert_eq!(stats.files, 5);
        assert_eq!(stats.bytes, disk_total(dir.path()));
    }

    #[test]
    fn test_names_sort_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();

        outbox.enqueue(&[make_event("first", 0)]).unwrap();
        outbox.enqueue(&[make_event("second", 0)]).unwrap();
        outbox.enqueue(&[make_event("third", 0)]).unwrap();

        let oldest = outbox.oldest_meta().unwrap();
        let batch = read_batch(&oldest.path).unwrap();
        assert_eq!(batch[0]["event"]["id"], json!("first"));
    }

    #[test]
    fn test_drop_oldest_on_overflow_keeps_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 500).unwrap();

        assert_eq!(outbox.enqueue(&[make_event("x", 400)]).unwrap(), 0);
        let dropped = outbox.enqueue(&[make_event("y", 400)]).unwrap();
        assert!(dropped > 0, "expected oldest events to be dropped");

        let stats = outbox.stats();
        assert_eq!(stats.files, 1);
        assert!(stats.dropped_events > 0);

        // the survivor is the newest batch
        let batch = read_batch(&outbox.oldest_meta().unwrap().path).unwrap();
        assert_eq!(batch[0]["event"]["id"], json!("y"));
    }

    #[test]
    fn test_single_oversized_file_is_never_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 100).unwrap();

        let dropped = outbox.enqueue(&[make_event("big", 400)]).unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(outbox.stats().files, 1);
    }

    #[test]
    fn test_remove_updates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();

        outbox.enqueue(&[make_event("e1", 0)]).unwrap();
        let meta = outbox.oldest_meta().unwrap();
        outbox.remove(&meta.name).unwrap();

        let stats = outbox.stats();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.bytes, 0);
        assert!(outbox.oldest_meta().is_none());
        // removing a name that is gone is not an error
        outbox.remove(&meta.name).unwrap();
    }

    #[test]
    fn test_discard_counts_dropped_events() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();

        outbox.enqueue(&[make_event("e1", 0), make_event("e2", 0)]).unwrap();
        let meta = outbox.oldest_meta().unwrap();
        outbox.discard(&meta);

        let stats = outbox.stats();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.dropped_events, 2);
        assert!(!meta.path.exists());
    }

    #[test]
    fn test_reload_restores_queue_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let outbox = DiskOutbox::new(dir.path(), 0).unwrap();
            outbox.enqueue(&[make_event("e1", 0)]).unwrap();
            outbox.enqueue(&[make_event("e2", 0), make_event("e3", 0)]).unwrap();
        }
        // stray non-spool files are ignored
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let outbox = DiskOutbox::new(dir.path(), 0).unwrap();
        let stats = outbox.stats();
        assert_eq!(stats.files, 2);
        assert_eq!(
            stats.bytes,
            disk_total(dir.path()) - "ignore me".len() as u64
        );
        assert_eq!(outbox.oldest_meta().unwrap().events, 1);
    }

    #[test]
    fn test_read_batch_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.ndjson");
        fs::write(&path, "{\"a\":1}\n\n  \n{\"b\":2}\n").unwrap();

        let batch = read_batch(&path).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1]["b"], json!(2));
    }

    #[test]
    fn test_read_batch_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.ndjson");
        fs::write(&path, "{\"a\":1}\nnot json\n").unwrap();

        assert!(read_batch(&path).is_err());
    }
}
