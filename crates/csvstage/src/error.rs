//! Error types for csvstage
//!
//! Two layers: [`ValidationError`] is the expected, row-level domain error
//! that the pipeline catches and records per row. [`StageError`] covers
//! fatal conditions (bad configuration, snapshot identity mismatch, store
//! failures) that always surface to the caller.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for csvstage operations
pub type Result<T> = std::result::Result<T, StageError>;

/// Row-level domain error raised by validation or preprocessing.
///
/// Caught per row and reported through the result snapshot; never escapes
/// `process_file`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Fatal error type for csvstage
#[derive(Error, Debug)]
pub enum StageError {
    /// Missing or invalid processor configuration (e.g. no unique id)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No operation record exists for the given id
    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    /// Snapshot type identity does not match the expected processor type.
    /// This can indicate tampering when several processor types share a store.
    #[error("Processor type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// Snapshot names a processor type that was never registered
    #[error("Unknown processor type: {0}")]
    UnknownType(String),

    /// Operation store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Task queue failure
    #[error("Task queue error: {0}")]
    Queue(String),

    /// Snapshot or payload (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error while reading the input stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decode failure that cannot be attributed to a single row
    #[error("CSV format error: {0}")]
    Format(#[from] csv::Error),
}

impl StageError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a task queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }
}
