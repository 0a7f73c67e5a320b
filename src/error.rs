//! Error types for the canopy library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`CanopyError`] enum.

use std::io;

use thiserror::Error;

/// The main error type for canopy operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    /// I/O errors (file operations, mapping, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed an integrity check. Reads that hit this error
    /// abort; there is no partial recovery.
    #[error("corrupt index: {0}")]
    Corrupt(String),

    /// Index-related errors (building, flushing).
    #[error("index error: {0}")]
    Index(String),

    /// Query-related errors (parsing, invalid clauses).
    #[error("query error: {0}")]
    Query(String),

    /// Storage-related errors (directories, streams).
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Invalid operation (e.g. writing into a flushed session).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Document record encoding errors.
    #[error("record error: {0}")]
    Record(#[from] bincode::Error),

    /// Generic anyhow error.
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with [`CanopyError`].
pub type Result<T> = std::result::Result<T, CanopyError>;

impl CanopyError {
    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        CanopyError::Corrupt(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        CanopyError::Index(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        CanopyError::Query(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        CanopyError::Storage(msg.into())
    }

    /// Create a new config error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CanopyError::Config(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        CanopyError::InvalidOperation(msg.into())
    }
}
