//! Per-worker session lifecycle.
//!
//! `ManagedSession` owns at most one live session and enforces the restart
//! policy around it:
//!
//! - construction is bounded by `start_timeout` and retried with
//!   exponential backoff until it succeeds or the worker is told to stop
//! - every execution is bounded by a hard timeout
//! - after `tasks_before_restart` tasks, or after a session-level error, the
//!   session is retired; teardown failures are logged and swallowed

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{DecodedActivity, Task};

use super::{Session, SessionError, SessionFactory, SessionOptions};

/// Why a session is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// The session reached `tasks_before_session_restart`.
    Threshold,
    /// A session-level error made the session unusable.
    SessionFault,
    /// The scheduler is shutting down.
    Shutdown,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Threshold => "threshold",
            RetireReason::SessionFault => "session_fault",
            RetireReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs of the session lifecycle, derived from `SchedulerConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub tasks_before_restart: u32,
    pub read_file_timeout: Duration,
    pub max_net_stabilization_delay: Duration,
    pub virtual_display: bool,
    pub start_timeout: Duration,
    pub teardown_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl SessionPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tasks_before_restart: config.tasks_before_session_restart,
            read_file_timeout: config.read_file_timeout,
            max_net_stabilization_delay: config.max_net_stabilization_delay,
            virtual_display: config.virtual_display,
            start_timeout: config.session_start_timeout,
            teardown_timeout: config.session_teardown_timeout,
            retry_initial: config.session_retry_initial,
            retry_max: config.session_retry_max,
        }
    }

    /// Hard deadline for one task: the read timeout plus the time the
    /// session is asked to wait for the network to settle, the latter capped
    /// at `max_net_stabilization_delay`.
    pub fn execution_timeout(&self, task: &Task) -> Duration {
        let delay = task
            .net_stabilization_delay
            .min(self.max_net_stabilization_delay);
        self.read_file_timeout.saturating_add(delay)
    }
}

/// A worker's session slot.
pub struct ManagedSession {
    worker_id: usize,
    factory: Arc<dyn SessionFactory>,
    policy: SessionPolicy,
    metrics: Arc<SchedulerMetrics>,
    session: Option<Box<dyn Session>>,
    tasks_processed: u32,
    generation: u64,
}

impl ManagedSession {
    pub fn new(
        worker_id: usize,
        factory: Arc<dyn SessionFactory>,
        policy: SessionPolicy,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            worker_id,
            factory,
            policy,
            metrics,
            session: None,
            tasks_processed: 0,
            generation: 0,
        }
    }

    /// Returns whether a live session is held.
    pub fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    /// Tasks executed by the current session.
    pub fn tasks_processed(&self) -> u32 {
        self.tasks_processed
    }

    /// Number of sessions constructed so far by this slot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns whether the current session reached the restart threshold.
    pub fn needs_restart(&self) -> bool {
        self.session.is_some() && self.tasks_processed >= self.policy.tasks_before_restart
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Constructs a session if none is held.
    ///
    /// Failed attempts are retried with exponential backoff. Returns `false`
    /// if `stop` resolves before a session could be built.
    pub async fn ensure_ready<F>(&mut self, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if self.session.is_some() {
            return true;
        }

        tokio::pin!(stop);

        let options = SessionOptions {
            worker_id: self.worker_id,
            virtual_display: self.policy.virtual_display,
            read_file_timeout: self.policy.read_file_timeout,
        };
        let mut delay = self.policy.retry_initial;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let created = tokio::select! {
                biased;

                _ = &mut stop => return false,

                created = tokio::time::timeout(
                    self.policy.start_timeout,
                    self.factory.create(&options),
                ) => created,
            };

            match created {
                Ok(Ok(session)) => {
                    self.session = Some(session);
                    self.tasks_processed = 0;
                    self.generation += 1;
                    self.metrics.record_session_start(true);

                    info!(
                        worker_id = self.worker_id,
                        generation = self.generation,
                        attempt = attempt,
                        "Session ready"
                    );
                    return true;
                }
                Ok(Err(e)) => {
                    self.metrics.record_session_start(false);
                    warn!(
                        worker_id = self.worker_id,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Session construction failed"
                    );
                }
                Err(_) => {
                    self.metrics.record_session_start(false);
                    warn!(
                        worker_id = self.worker_id,
                        attempt = attempt,
                        timeout_ms = self.policy.start_timeout.as_millis() as u64,
                        retry_in_ms = delay.as_millis() as u64,
                        "Session construction timed out"
                    );
                }
            }

            tokio::select! {
                biased;

                _ = &mut stop => return false,

                _ = tokio::time::sleep(delay) => {}
            }

            delay = delay.saturating_mul(2).min(self.policy.retry_max);
        }
    }

    /// Executes a task against the held session under the hard timeout.
    ///
    /// The task counts towards the restart threshold whatever the result.
    pub async fn execute(&mut self, task: &Task) -> Result<DecodedActivity, SessionError> {
        let timeout = self.policy.execution_timeout(task);
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SessionError::Startup("no active session".to_string()))?;

        let result = match tokio::time::timeout(timeout, session.execute(task, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };

        self.tasks_processed += 1;
        result
    }

    /// Tears the held session down. Never fails; problems are logged.
    pub async fn retire(&mut self, reason: RetireReason) {
        let Some(session) = self.session.take() else {
            return;
        };

        info!(
            worker_id = self.worker_id,
            generation = self.generation,
            tasks_processed = self.tasks_processed,
            reason = %reason,
            "Retiring session"
        );

        self.metrics.record_session_retired(reason.as_str());
        self.tasks_processed = 0;

        match tokio::time::timeout(self.policy.teardown_timeout, session.destroy()).await {
            Ok(Ok(())) => {
                debug!(worker_id = self.worker_id, "Session torn down");
            }
            Ok(Err(e)) => {
                warn!(
                    worker_id = self.worker_id,
                    error = %e,
                    "Session teardown failed"
                );
            }
            Err(_) => {
                warn!(
                    worker_id = self.worker_id,
                    timeout_ms = self.policy.teardown_timeout.as_millis() as u64,
                    "Session teardown timed out"
                );
            }
        }
    }
}
