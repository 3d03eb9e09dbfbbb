//! Error types for activity-decoder operations.
//!
//! The caller-facing contract of the scheduler is deliberately small:
//! - `PutError` for task submission
//! - `GetError` for outcome lookup
//!
//! Everything else (configuration, startup, front end) has its own enum so
//! internal faults never leak into the `put`/`get` contract.

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::TaskId;

/// Errors returned by `Scheduler::put`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PutError {
    /// The task queue is at capacity; retry later.
    #[error("Task queue is full")]
    QueueIsFull,
}

/// Errors returned by `Scheduler::get`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError {
    /// The id was never issued, or its outcome expired and was evicted.
    #[error("Task '{0}' not found")]
    TaskIdNotFound(TaskId),

    /// The task is known but no outcome has been recorded yet.
    #[error("Task '{0}' has not completed yet")]
    TaskNotCompleted(TaskId),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while starting the scheduler.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors that can occur in the unix-socket front end.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind socket '{path}': {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("Connection closed before a request was received")]
    EmptyRequest,
}

/// Errors returned by the socket client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to '{path}': {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server closed the connection without a response")]
    NoResponse,

    #[error("Server rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(String),

    #[error("Timed out after {0:?} waiting for task to complete")]
    WaitTimeout(std::time::Duration),
}

impl ClientError {
    /// Server error code of a rejected request.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}
