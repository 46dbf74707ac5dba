//! Error types for the audit pipeline
//!
//! Every component returns [`AuditError`]. Long-running tasks absorb
//! retriable errors at their loop boundary (log + metric) and keep going.
//! Startup errors (store connection, partition discovery) propagate to the
//! caller, and a permanent fetch error stops the affected partition worker.

use thiserror::Error;

/// Audit pipeline errors
#[derive(Error, Debug)]
pub enum AuditError {
    /// Columnar store error
    #[error("Store error: {0}")]
    Store(String),

    /// Message queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Cursor store error
    #[error("Cursor error: {0}")]
    Cursor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The topic or partition does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The topic or partition was closed by the queue
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// An internal channel was closed (receiver gone)
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Downstream handler failure
    #[error("Handler error: {0}")]
    Handler(String),
}

impl AuditError {
    /// Create a new store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new cursor error
    pub fn cursor(msg: impl Into<String>) -> Self {
        Self::Cursor(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on a later attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Store(_) | Self::Queue(_) | Self::Cursor(_) | Self::Timeout(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::NotFound(_)
            | Self::QueueClosed(_)
            | Self::ChannelClosed(_)
            | Self::Handler(_) => false,
        }
    }

    /// Whether the error means the input side has ended and the loop should stop.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::QueueClosed(_) | Self::ChannelClosed(_))
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_error",
            Self::Queue(_) => "queue_error",
            Self::Cursor(_) => "cursor_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::QueueClosed(_) => "queue_closed",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Handler(_) => "handler_error",
        }
    }
}

/// Result type for audit pipeline operations
pub type Result<T> = std::result::Result<T, AuditError>;
