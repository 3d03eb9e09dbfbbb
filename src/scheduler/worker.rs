//! Worker loop.
//!
//! Each worker owns one `ManagedSession` and repeats:
//!
//! 1. make sure a session is ready (retrying construction)
//! 2. take the next task from the shared queue
//! 3. execute it and record exactly one outcome
//! 4. retire the session if the task broke it or the threshold is reached
//!
//! Workers follow the scheduler's `RunState`: they stop taking tasks once
//! the queue is closed, and drop the task in flight when told to abort.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::SchedulerMetrics;
use crate::session::{ManagedSession, RetireReason};

use super::queue::TaskQueue;
use super::store::ResultStore;
use super::task::{FailureKind, Outcome, Task, TaskFailure};

/// Lifecycle signal broadcast from the scheduler to its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Normal operation.
    Running,
    /// Finish the task in flight, take no new ones.
    Draining,
    /// Drop the task in flight and tear the session down.
    Aborting,
}

/// Waits until `state` satisfies `done`. Returns as well if the scheduler
/// side of the channel is gone.
pub(crate) async fn wait_for_state<F>(state: &mut watch::Receiver<RunState>, done: F)
where
    F: Fn(RunState) -> bool,
{
    let _ = state.wait_for(|current| done(*current)).await;
}

/// One member of the worker pool.
pub(crate) struct Worker {
    id: usize,
    queue: Arc<TaskQueue>,
    store: Arc<ResultStore>,
    metrics: Arc<SchedulerMetrics>,
    session: ManagedSession,
    state: watch::Receiver<RunState>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queue: Arc<TaskQueue>,
        store: Arc<ResultStore>,
        metrics: Arc<SchedulerMetrics>,
        session: ManagedSession,
        state: watch::Receiver<RunState>,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            metrics,
            session,
            state,
        }
    }

    /// Spawns the worker loop onto the runtime.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(worker_id = self.id, "Worker started");

        loop {
            let ready = {
                let Self { session, state, .. } = &mut self;
                session
                    .ensure_ready(wait_for_state(state, |s| s != RunState::Running))
                    .await
            };
            if !ready {
                debug!(worker_id = self.id, "Stopped before a session was ready");
                break;
            }

            let Some(task) = self.queue.dequeue().await else {
                debug!(worker_id = self.id, "Queue closed");
                break;
            };

            self.process(task).await;
        }

        self.session.retire(RetireReason::Shutdown).await;
        info!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&mut self, task: Task) {
        let task_id = task.id;
        let started = Instant::now();

        debug!(
            worker_id = self.id,
            task_id = %task_id,
            generation = self.session.generation(),
            queued_ms = task.age().num_milliseconds(),
            "Processing task"
        );

        self.metrics.worker_busy();
        let result = {
            let Self { session, state, .. } = &mut *self;
            tokio::select! {
                biased;

                _ = wait_for_state(state, |s| s == RunState::Aborting) => None,

                result = session.execute(&task) => Some(result),
            }
        };
        self.metrics.worker_idle();

        let elapsed = started.elapsed();
        let ttl = self.store.ttl();

        let (outcome, retire) = match result {
            Some(Ok(value)) => {
                debug!(
                    worker_id = self.id,
                    task_id = %task_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                (Outcome::completed(task_id, value, ttl), None)
            }
            Some(Err(e)) => {
                let fatal = e.is_session_fatal();
                warn!(
                    worker_id = self.id,
                    task_id = %task_id,
                    kind = %e.failure_kind(),
                    session_fatal = fatal,
                    error = %e,
                    "Task failed"
                );
                let failure = TaskFailure::new(e.failure_kind(), e.to_string());
                let retire = fatal.then_some(RetireReason::SessionFault);
                (Outcome::failed(task_id, failure, ttl), retire)
            }
            None => {
                warn!(
                    worker_id = self.id,
                    task_id = %task_id,
                    "Task cancelled by shutdown"
                );
                let failure = TaskFailure::new(
                    FailureKind::Cancelled,
                    "scheduler shut down while the task was executing",
                );
                (
                    Outcome::failed(task_id, failure, ttl),
                    Some(RetireReason::Shutdown),
                )
            }
        };

        self.metrics.record_outcome(&outcome, elapsed);
        self.store.record(outcome);

        let retire = retire.or_else(|| {
            self.session
                .needs_restart()
                .then_some(RetireReason::Threshold)
        });
        if let Some(reason) = retire {
            self.session.retire(reason).await;
        }
    }
}
