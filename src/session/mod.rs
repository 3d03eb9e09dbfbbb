//! Sessions: long-lived handles to the external automation environment.
//!
//! A session is expensive to construct, serves many tasks, and degrades over
//! time. The scheduler never depends on a concrete session type; it only
//! sees the two traits defined here:
//!
//! - `SessionFactory`: constructs a session for a worker
//! - `Session`: executes tasks and is destroyed when retired
//!
//! `ManagedSession` wraps a factory with the per-worker lifecycle (retry
//! with backoff, hard execution timeout, restart threshold, best-effort
//! teardown). `ProcessSessionFactory` is the production adapter driving a
//! helper program, optionally under a virtual display.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──create──▶ Ready ──execute──▶ Busy ──▶ Ready
//!       ▲                                          │
//!       └──────────── Retiring ◀── threshold / session fault
//! ```

pub mod display;
pub mod lifecycle;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::{DecodedActivity, FailureKind, Task};

pub use display::VirtualDisplay;
pub use lifecycle::{ManagedSession, RetireReason, SessionPolicy};
pub use process::{ProcessSession, ProcessSessionFactory};

/// Errors raised by sessions.
///
/// Variants are split into task-level failures, which leave the session
/// usable, and session-level failures, which force its retirement.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The activity payload or password was rejected.
    #[error("Invalid activity: {0}")]
    BadInput(String),

    /// The activity could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The session did not answer within the hard timeout.
    #[error("Session timed out after {0:?}")]
    Timeout(Duration),

    /// The session answered with something it should not have.
    #[error("Session is unresponsive: {0}")]
    Unresponsive(String),

    /// The external process went away.
    #[error("Session process crashed: {0}")]
    Crashed(String),

    /// The session could not be constructed.
    #[error("Session startup failed: {0}")]
    Startup(String),

    /// Tearing the session down failed.
    #[error("Session teardown failed: {0}")]
    Teardown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns whether the session must be retired after this error.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, SessionError::BadInput(_) | SessionError::Decode(_))
    }

    /// Maps the error to the failure kind recorded in the outcome.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::BadInput(_) => FailureKind::BadInput,
            SessionError::Decode(_) => FailureKind::Decode,
            SessionError::Timeout(_) => FailureKind::Timeout,
            SessionError::Unresponsive(_)
            | SessionError::Crashed(_)
            | SessionError::Startup(_)
            | SessionError::Teardown(_)
            | SessionError::Io(_) => FailureKind::SessionFault,
        }
    }
}

/// Parameters handed to `SessionFactory::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Index of the worker that will own the session.
    pub worker_id: usize,
    /// Whether the session must run under a virtual display.
    pub virtual_display: bool,
    /// How long the session may wait on an activity payload.
    pub read_file_timeout: Duration,
}

/// A constructed, ready-to-use automation session.
#[async_trait]
pub trait Session: Send {
    /// Executes one task. The caller enforces the hard timeout; `timeout` is
    /// passed so the session can bound its own waits.
    async fn execute(
        &mut self,
        task: &Task,
        timeout: Duration,
    ) -> Result<DecodedActivity, SessionError>;

    /// Releases every resource held by the session.
    async fn destroy(self: Box<Self>) -> Result<(), SessionError>;
}

/// Builds sessions for workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, options: &SessionOptions) -> Result<Box<dyn Session>, SessionError>;
}
