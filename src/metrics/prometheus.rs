//! Prometheus metrics registration and export.
//!
//! Every scheduler owns its own `Registry`, so several schedulers (tests
//! included) can live in one process without clashing on metric names.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::scheduler::Outcome;

use super::SchedulerStats;

/// Metrics recorded by the scheduler, its workers and their sessions.
pub struct SchedulerMetrics {
    registry: Registry,
    tasks_submitted: IntCounter,
    tasks_rejected: IntCounter,
    tasks_total: IntCounterVec,
    task_failures: IntCounterVec,
    task_duration: Histogram,
    queue_depth: IntGauge,
    active_workers: IntGauge,
    sessions_ready: IntGauge,
    session_starts: IntCounterVec,
    session_retirements: IntCounterVec,
    outcomes_evicted: IntCounter,
}

impl SchedulerMetrics {
    /// Creates all metrics and registers them with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Task metrics
        let tasks_submitted = IntCounter::new(
            "activity_decoder_tasks_submitted_total",
            "Tasks accepted by put",
        )?;

        let tasks_rejected = IntCounter::new(
            "activity_decoder_tasks_rejected_total",
            "Tasks rejected because the queue was full or closed",
        )?;

        let tasks_total = IntCounterVec::new(
            Opts::new("activity_decoder_tasks_total", "Tasks executed, by outcome status"),
            &["status"],
        )?;

        let task_failures = IntCounterVec::new(
            Opts::new("activity_decoder_task_failures_total", "Failed tasks, by failure kind"),
            &["kind"],
        )?;

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "activity_decoder_task_duration_seconds",
                "Task execution duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        // Queue and worker metrics
        let queue_depth = IntGauge::new("activity_decoder_queue_depth", "Tasks waiting in the queue")?;

        let active_workers = IntGauge::new(
            "activity_decoder_active_workers",
            "Workers currently executing a task",
        )?;

        // Session metrics
        let sessions_ready = IntGauge::new("activity_decoder_sessions_ready", "Live sessions")?;

        let session_starts = IntCounterVec::new(
            Opts::new(
                "activity_decoder_session_starts_total",
                "Session construction attempts, by result",
            ),
            &["result"],
        )?;

        let session_retirements = IntCounterVec::new(
            Opts::new(
                "activity_decoder_session_retirements_total",
                "Sessions torn down, by reason",
            ),
            &["reason"],
        )?;

        let outcomes_evicted = IntCounter::new(
            "activity_decoder_outcomes_evicted_total",
            "Expired outcomes removed by the eviction sweep",
        )?;

        registry.register(Box::new(tasks_submitted.clone()))?;
        registry.register(Box::new(tasks_rejected.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_failures.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(sessions_ready.clone()))?;
        registry.register(Box::new(session_starts.clone()))?;
        registry.register(Box::new(session_retirements.clone()))?;
        registry.register(Box::new(outcomes_evicted.clone()))?;

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_rejected,
            tasks_total,
            task_failures,
            task_duration,
            queue_depth,
            active_workers,
            sessions_ready,
            session_starts,
            session_retirements,
            outcomes_evicted,
        })
    }

    /// Registry holding every scheduler metric.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_submitted(&self) {
        self.tasks_submitted.inc();
    }

    pub fn record_rejected(&self) {
        self.tasks_rejected.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn worker_busy(&self) {
        self.active_workers.inc();
    }

    pub fn worker_idle(&self) {
        self.active_workers.dec();
    }

    /// Records a finished task.
    pub fn record_outcome(&self, outcome: &Outcome, elapsed: Duration) {
        let status = if outcome.is_success() { "completed" } else { "failed" };
        self.tasks_total.with_label_values(&[status]).inc();
        if let Some(error) = &outcome.error {
            self.task_failures
                .with_label_values(&[error.kind.as_str()])
                .inc();
        }
        self.task_duration.observe(elapsed.as_secs_f64());
    }

    /// Records a session construction attempt.
    pub fn record_session_start(&self, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.session_starts.with_label_values(&[result]).inc();
        if success {
            self.sessions_ready.inc();
        }
    }

    /// Records a session teardown.
    pub fn record_session_retired(&self, reason: &str) {
        self.session_retirements.with_label_values(&[reason]).inc();
        self.sessions_ready.dec();
    }

    pub fn record_evicted(&self, count: usize) {
        self.outcomes_evicted.inc_by(count as u64);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> SchedulerStats {
        let retirements = |reason: &str| self.session_retirements.with_label_values(&[reason]).get();

        SchedulerStats {
            queued: self.queue_depth.get().max(0) as usize,
            active_workers: self.active_workers.get().max(0) as usize,
            sessions_ready: self.sessions_ready.get().max(0) as usize,
            tasks_submitted: self.tasks_submitted.get(),
            tasks_rejected: self.tasks_rejected.get(),
            tasks_completed: self.tasks_total.with_label_values(&["completed"]).get(),
            tasks_failed: self.tasks_total.with_label_values(&["failed"]).get(),
            sessions_started: self.session_starts.with_label_values(&["ok"]).get(),
            session_start_failures: self.session_starts.with_label_values(&["error"]).get(),
            session_restarts: retirements("threshold") + retirements("session_fault"),
            outcomes_evicted: self.outcomes_evicted.get(),
        }
    }

    /// Exports all metrics in the Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::scheduler::{FailureKind, TaskFailure};

    #[test]
    fn test_independent_registries() {
        let first = SchedulerMetrics::new().expect("first registry");
        let second = SchedulerMetrics::new().expect("second registry");

        first.record_submitted();
        assert_eq!(first.snapshot().tasks_submitted, 1);
        assert_eq!(second.snapshot().tasks_submitted, 0);
    }

    #[test]
    fn test_outcomes_are_counted_by_status() {
        let metrics = SchedulerMetrics::new().expect("registry");
        let ttl = Duration::from_secs(60);

        metrics.record_outcome(
            &Outcome::completed(Uuid::new_v4(), serde_json::Value::Null, ttl),
            Duration::from_millis(200),
        );
        metrics.record_outcome(
            &Outcome::failed(
                Uuid::new_v4(),
                TaskFailure::new(FailureKind::Timeout, "too slow"),
                ttl,
            ),
            Duration::from_secs(30),
        );

        let stats = metrics.snapshot();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_failed, 1);
    }

    #[test]
    fn test_session_gauges() {
        let metrics = SchedulerMetrics::new().expect("registry");
        metrics.record_session_start(false);
        metrics.record_session_start(true);
        metrics.record_session_start(true);
        metrics.record_session_retired("threshold");
        metrics.record_session_retired("shutdown");

        let stats = metrics.snapshot();
        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.session_start_failures, 1);
        assert_eq!(stats.sessions_ready, 0);
        assert_eq!(stats.session_restarts, 1);
    }

    #[test]
    fn test_export_contains_metric_names() {
        let metrics = SchedulerMetrics::new().expect("registry");
        metrics.record_submitted();
        metrics.set_queue_depth(3);

        let text = metrics.export();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("activity_decoder_tasks_submitted_total 1"));
        assert!(text.contains("activity_decoder_queue_depth 3"));
    }
}
