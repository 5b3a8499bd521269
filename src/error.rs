//! Error types for feedmon.

use thiserror::Error;

/// Common error type for feedmon.
///
/// Classified fetch outcomes (HTTP errors, timeouts and so on) are not
/// errors; they are recorded as [`crate::fetch::FetchStatus`] values.
#[derive(Error, Debug)]
pub enum FeedmonError {
    /// Database error.
    ///
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// Database connection error.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Queue error (send, receive or delete failed).
    #[error("queue error: {0}")]
    Queue(String),

    /// Local fetch machinery error (not a classified fetch outcome).
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Message body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for FeedmonError {
    fn from(e: sqlx::Error) -> Self {
        FeedmonError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for FeedmonError {
    fn from(e: serde_json::Error) -> Self {
        FeedmonError::Serialization(e.to_string())
    }
}

/// Result type alias for feedmon operations.
pub type Result<T> = std::result::Result<T, FeedmonError>;
