//! Structured error types for vigil
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever reach instrumented code: hooks swallow them, log them
//! and forward them to [`Collector::collect_error`](crate::collector::Collector::collect_error).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("Thread {0} no longer exists")]
    ThreadGone(String),

    #[error("Stack of thread {0} is unavailable: {1}")]
    StackUnavailable(String, String),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to serialize operation: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
