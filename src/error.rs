//! Error types for Full Score

use thiserror::Error;

/// Errors surfaced by the fallible parts of the crate.
///
/// The codec, classifier and session engine never fail on bad input; they
/// degrade to "no signal". This enum covers configuration, strict record
/// parsing and the I/O edges (CLI, FFI).
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed session record: {0}")]
    MalformedRecord(String),

    #[error("Malformed movement record: {0}")]
    MalformedMovement(String),

    #[error("Cookie header rejected: {0}")]
    HeaderRejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Date parse error: {0}")]
    DateParseError(String),

    #[error("Nothing to archive: {0}")]
    EmptyBatch(String),
}
