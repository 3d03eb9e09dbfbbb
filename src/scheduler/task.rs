//! Task and outcome definitions for the scheduler.
//!
//! - `Task`: one activity payload submitted through `Scheduler::put`
//! - `Outcome`: the recorded result of executing a task
//! - `TaskFailure` / `FailureKind`: why a task failed

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier handed out by `Scheduler::put`.
pub type TaskId = Uuid;

/// Decoded activity returned by a session.
pub type DecodedActivity = serde_json::Value;

/// A unit of work executed by exactly one worker.
#[derive(Clone)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Raw activity file contents.
    pub activity: Vec<u8>,
    /// Optional password protecting the activity file.
    pub password: Option<String>,
    /// Time the session waits for the network to settle before reading.
    pub net_stabilization_delay: Duration,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task with a fresh id.
    pub fn new(
        activity: Vec<u8>,
        password: Option<String>,
        net_stabilization_delay: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            activity,
            password,
            net_stabilization_delay,
            submitted_at: Utc::now(),
        }
    }

    /// Returns how long ago the task was submitted.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.submitted_at
    }
}

// The password must never end up in logs.
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("activity_len", &self.activity.len())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("net_stabilization_delay", &self.net_stabilization_delay)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// Status of a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The session produced a decoded activity.
    Completed,
    /// Execution failed; see `Outcome::error`.
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The activity payload or password was rejected.
    BadInput,
    /// The session could not decode the activity.
    Decode,
    /// The hard execution timeout elapsed.
    Timeout,
    /// The session became unusable while executing the task.
    SessionFault,
    /// The scheduler shut down while the task was executing.
    Cancelled,
}

impl FailureKind {
    /// Stable label used in metrics and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BadInput => "bad_input",
            FailureKind::Decode => "decode",
            FailureKind::Timeout => "timeout",
            FailureKind::SessionFault => "session_fault",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of executing a task, retrievable until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Task this outcome belongs to.
    pub task_id: TaskId,
    /// Completed or failed.
    pub status: OutcomeStatus,
    /// Decoded activity for completed tasks.
    #[serde(default)]
    pub value: Option<DecodedActivity>,
    /// Failure details for failed tasks.
    #[serde(default)]
    pub error: Option<TaskFailure>,
    /// When the outcome was recorded.
    pub produced_at: DateTime<Utc>,
    /// When the outcome stops being retrievable.
    pub expires_at: DateTime<Utc>,
}

impl Outcome {
    /// Creates a completed outcome.
    pub fn completed(task_id: TaskId, value: DecodedActivity, ttl: Duration) -> Self {
        let (produced_at, expires_at) = Self::timestamps(ttl);
        Self {
            task_id,
            status: OutcomeStatus::Completed,
            value: Some(value),
            error: None,
            produced_at,
            expires_at,
        }
    }

    /// Creates a failed outcome.
    pub fn failed(task_id: TaskId, failure: TaskFailure, ttl: Duration) -> Self {
        let (produced_at, expires_at) = Self::timestamps(ttl);
        Self {
            task_id,
            status: OutcomeStatus::Failed,
            value: None,
            error: Some(failure),
            produced_at,
            expires_at,
        }
    }

    /// Returns whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    fn timestamps(ttl: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let produced_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = produced_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (produced_at, expires_at)
    }
}
