use std::path::PathBuf;

use thiserror::Error;

/// Process-level failures. Anything here aborts the run, because continuing
/// would break the resume guarantee or lose accepted records.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to read input {path}: {message}")]
    Input { path: PathBuf, message: String },

    #[error("Checkpoint {path} is not writable: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Data sink gave up after {attempts} attempts, {unwritten} records left unwritten: {source}")]
    SinkExhausted {
        attempts: u32,
        unwritten: usize,
        #[source]
        source: SinkError,
    },

    #[error("Buffer pool stopped unexpectedly: {0}")]
    Buffer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure appending a batch to the data sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Returned by `BufferPool::put` once the pool no longer accepts records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer pool is stopped")]
    Stopped,
}

/// Classifies a failed attempt for retry and window decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Server-side throttling (HTTP 503 / 429).
    RateLimited,
    /// Network, timeout or server hiccup; worth retrying.
    Transient,
    /// Will never succeed for this item (auth, validation, gone).
    Fatal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::RateLimited => write!(f, "RateLimited"),
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Fatal => write!(f, "Fatal"),
        }
    }
}
