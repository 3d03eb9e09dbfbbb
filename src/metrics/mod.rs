//! Scheduler metrics.
//!
//! `SchedulerMetrics` records Prometheus counters and gauges for queueing,
//! task execution and the session lifecycle. `SchedulerStats` is a plain
//! snapshot of the same numbers for callers that do not scrape Prometheus.

pub mod prometheus;

use serde::{Deserialize, Serialize};

pub use self::prometheus::SchedulerMetrics;

/// Snapshot of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Workers currently executing a task.
    pub active_workers: usize,
    /// Live sessions.
    pub sessions_ready: usize,
    pub tasks_submitted: u64,
    pub tasks_rejected: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Successful session constructions.
    pub sessions_started: u64,
    pub session_start_failures: u64,
    /// Sessions retired by the restart threshold or after a fault.
    pub session_restarts: u64,
    pub outcomes_evicted: u64,
}
