//! Error types for Spindle

use thiserror::Error;

/// Result type alias for Spindle operations
pub type Result<T> = std::result::Result<T, SpindleError>;

/// Main error type for Spindle
#[derive(Error, Debug)]
pub enum SpindleError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Enrichment database error (open only; lookups degrade silently)
    #[error("enrichment database: {0}")]
    Enrich(String),

    /// Output delivery error
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// Server error
    #[error("server error: {0}")]
    Server(String),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for output sinks and the durable outbox
#[derive(Error, Debug)]
pub enum OutputError {
    /// Event could not be serialized
    #[error("serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Transport-level delivery failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status
    #[error("{backend} returned {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    /// Spool or stdout IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A spool file could not be parsed and was discarded
    #[error("spool file {name} unreadable, dropped batch: {source}")]
    SpoolUnreadable {
        name: String,
        #[source]
        source: Box<OutputError>,
    },

    /// Insert failed but the batch was accepted into the outbox.
    /// Reported through the flush callback, never returned to callers.
    #[error(
        "insert failed; queued to outbox (dropped_oldest_events={dropped} \
         queue_files={files} queue_bytes={bytes}): {source}"
    )]
    Spooled {
        dropped: usize,
        files: usize,
        bytes: u64,
        #[source]
        source: Box<OutputError>,
    },
}
