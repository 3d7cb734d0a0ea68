//! Error types for usagesync-core

use thiserror::Error;

/// Main error type for the usagesync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value store database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid host pattern or path predicate in a rule table
    #[error("rule error: {0}")]
    Rules(String),

    /// Counter service transport error (network, timeout, non-success status)
    #[error("transport error: {0}")]
    Transport(String),

    /// A stored value could not be interpreted
    #[error("store error: {0}")]
    Store(String),

    /// The tracking service task is no longer running
    #[error("tracking service stopped")]
    ServiceStopped,
}

/// Result type alias for usagesync-core
pub type Result<T> = std::result::Result<T, Error>;
