//! Error types for the container log pipeline
//!
//! Errors fall into two classes. [`LogsError`] is returned synchronously by
//! [`LogStreamer::stream`](crate::LogStreamer::stream) before any background
//! work starts. [`LogReadError`] happens after the handoff and only ever
//! travels inside a terminal [`LogMessage`](crate::LogMessage).

use thiserror::Error;

/// Coarse classification of a [`LogsError`], for transports that need to pick
/// a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Unsupported,
    Internal,
}

/// Pre-stream failure: validation, container lookup or timestamp parsing.
#[derive(Debug, Error)]
pub enum LogsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No such container: {container}")]
    NotFound { container: String },

    #[error("Can not get logs from container {container} which is dead or marked for removal")]
    Conflict { container: String },

    #[error("Configured logging driver \"{driver}\" does not support reading")]
    Unsupported { driver: String },

    #[error("Invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Container backend error: {0}")]
    Backend(String),
}

impl LogsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LogsError::InvalidArgument(_) | LogsError::InvalidTimestamp { .. } => {
                ErrorKind::InvalidArgument
            }
            LogsError::NotFound { .. } => ErrorKind::NotFound,
            LogsError::Conflict { .. } => ErrorKind::Conflict,
            LogsError::Unsupported { .. } => ErrorKind::Unsupported,
            LogsError::Backend(_) => ErrorKind::Internal,
        }
    }
}

/// Fatal failure reported by a log reader once streaming has started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogReadError {
    #[error("Docker API error: {0}")]
    Docker(String),

    #[error("{0}")]
    Driver(String),
}

/// Failure while releasing a log driver.
#[derive(Debug, Error)]
pub enum LogDriverError {
    #[error("log driver already closed")]
    AlreadyClosed,

    #[error("failed to close log driver: {0}")]
    Close(String),
}
