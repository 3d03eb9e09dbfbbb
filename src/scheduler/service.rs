//! Scheduler facade: owns the queue, the result store, the worker pool and
//! the eviction task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{GetError, PutError, StartError};
use crate::metrics::{SchedulerMetrics, SchedulerStats};
use crate::session::{ManagedSession, SessionFactory, SessionPolicy};

use super::queue::TaskQueue;
use super::store::ResultStore;
use super::task::{Outcome, Task, TaskId};
use super::worker::{wait_for_state, RunState, Worker};

/// What `Scheduler::shutdown` had to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight tasks outlived the grace period and were cancelled.
    pub forced: bool,
    /// Tasks still queued at shutdown, dropped without execution.
    pub discarded_tasks: usize,
}

#[derive(Default)]
struct BackgroundTasks {
    workers: Vec<JoinHandle<()>>,
    evictor: Option<JoinHandle<()>>,
}

/// Accepts tasks, executes them on a fixed pool of session-owning workers,
/// and keeps their outcomes for `result_ttl`.
///
/// `put` and `get` are synchronous and may be called from any task. The
/// scheduler must be stopped with `shutdown` (or used through `scope`).
///
/// Dropping it without shutdown aborts the workers without calling
/// `Session::destroy`; live sessions are then only cleaned up if the session
/// type releases its resources on drop, as `ProcessSession` does by killing
/// its processes.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    store: Arc<ResultStore>,
    metrics: Arc<SchedulerMetrics>,
    state: watch::Sender<RunState>,
    tasks: Mutex<BackgroundTasks>,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Validates `config`, then spawns the workers and the eviction task.
    ///
    /// Must be called from within a tokio runtime. Sessions are constructed
    /// by the workers in the background.
    pub fn start(
        config: SchedulerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let metrics = Arc::new(SchedulerMetrics::new()?);
        let queue = Arc::new(TaskQueue::new(config.queue_size));
        let store = Arc::new(ResultStore::new(config.result_ttl));
        let (state, _) = watch::channel(RunState::Running);
        let policy = SessionPolicy::from_config(&config);

        let workers = (0..config.workers_num)
            .map(|id| {
                let session = ManagedSession::new(
                    id,
                    Arc::clone(&factory),
                    policy.clone(),
                    Arc::clone(&metrics),
                );
                Worker::new(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&store),
                    Arc::clone(&metrics),
                    session,
                    state.subscribe(),
                )
                .spawn()
            })
            .collect();

        let evictor = spawn_evictor(
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.eviction_interval,
            state.subscribe(),
        );

        info!(
            workers = config.workers_num,
            queue_size = config.queue_size,
            result_ttl_secs = config.result_ttl.as_secs_f64(),
            virtual_display = config.virtual_display,
            "Scheduler started"
        );

        Ok(Self {
            config,
            queue,
            store,
            metrics,
            state,
            tasks: Mutex::new(BackgroundTasks {
                workers,
                evictor: Some(evictor),
            }),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Starts a scheduler, runs `f` with it and shuts it down afterwards.
    ///
    /// Shutdown happens whether `f` returns normally, returns an error
    /// value or panics; a panic is resumed once shutdown is complete.
    pub async fn scope<F, Fut, T>(
        config: SchedulerConfig,
        factory: Arc<dyn SessionFactory>,
        f: F,
    ) -> Result<T, StartError>
    where
        F: FnOnce(Arc<Scheduler>) -> Fut,
        Fut: Future<Output = T>,
    {
        let scheduler = Arc::new(Self::start(config, factory)?);

        let handle = Arc::clone(&scheduler);
        let result = AssertUnwindSafe(async move { f(handle).await })
            .catch_unwind()
            .await;

        scheduler.shutdown().await;

        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Submits an activity for decoding and returns its task id.
    ///
    /// `net_stabilization_delay` is clamped to
    /// `SchedulerConfig::max_net_stabilization_delay`. Fails fast with `PutError::QueueIsFull` when the queue is at capacity
    /// or the scheduler is shutting down.
    pub fn put(
        &self,
        activity: Vec<u8>,
        password: Option<String>,
        net_stabilization_delay: Duration,
    ) -> Result<TaskId, PutError> {
        let clamped = self.config.clamp_net_stabilization_delay(net_stabilization_delay);
        if clamped < net_stabilization_delay {
            debug!(
                requested_secs = net_stabilization_delay.as_secs_f64(),
                max_secs = clamped.as_secs_f64(),
                "Clamping network stabilization delay"
            );
        }
        let task = Task::new(activity, password, clamped);
        let task_id = task.id;

        // Registered first so a worker finishing early still finds the id.
        self.store.register(task_id);

        match self.queue.enqueue(task) {
            Ok(()) => {
                self.metrics.record_submitted();
                debug!(task_id = %task_id, queued = self.queue.len(), "Task accepted");
                Ok(task_id)
            }
            Err(e) => {
                self.store.forget(task_id);
                self.metrics.record_rejected();
                debug!(reason = %e, "Task rejected");
                Err(PutError::QueueIsFull)
            }
        }
    }

    /// Returns the outcome of a task.
    pub fn get(&self, task_id: TaskId) -> Result<Outcome, GetError> {
        self.store.lookup(task_id)
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        self.metrics.set_queue_depth(self.queue.len());
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of the scheduler metrics.
    pub fn export_metrics(&self) -> String {
        self.metrics.set_queue_depth(self.queue.len());
        self.metrics.export()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops the scheduler.
    ///
    /// 1. closes the queue so `put` fails and idle workers exit
    /// 2. waits up to `shutdown_grace` for tasks in flight
    /// 3. past the grace period, cancels them (recorded as `cancelled`) and
    ///    waits `session_teardown_timeout` for sessions to be torn down,
    ///    aborting whatever is left
    /// 4. discards queued tasks and clears the result store
    ///
    /// Calling it again is a no-op returning an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut tasks = self.tasks.lock().await;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        info!(
            grace_secs = self.config.shutdown_grace.as_secs_f64(),
            queued = self.queue.len(),
            "Scheduler shutting down"
        );

        self.queue.close();
        self.state.send_replace(RunState::Draining);

        let mut forced = false;
        let drained =
            tokio::time::timeout(self.config.shutdown_grace, join_all(tasks.workers.iter_mut()))
                .await;

        match drained {
            Ok(results) => log_worker_exits(results),
            Err(_) => {
                forced = true;
                warn!(
                    grace_secs = self.config.shutdown_grace.as_secs_f64(),
                    "Shutdown grace period elapsed, cancelling tasks in flight"
                );
                self.state.send_replace(RunState::Aborting);
                tasks.workers.retain(|handle| !handle.is_finished());

                let teardown = self.config.session_teardown_timeout + ABORT_SLACK;
                let stopped =
                    tokio::time::timeout(teardown, join_all(tasks.workers.iter_mut())).await;
                match stopped {
                    Ok(results) => log_worker_exits(results),
                    Err(_) => {
                        error!(
                            remaining = tasks.workers.len(),
                            "Workers did not stop in time, aborting them"
                        );
                        for handle in &tasks.workers {
                            handle.abort();
                        }
                        // Sessions held by an aborted worker die when its future is dropped.
                        log_worker_exits(join_all(tasks.workers.iter_mut()).await);
                    }
                }
            }
        }
        tasks.workers.clear();

        if let Some(evictor) = tasks.evictor.take() {
            evictor.abort();
        }

        let discarded = self.queue.drain().await;
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "Discarding queued tasks");
        }
        self.store.clear();
        self.metrics.set_queue_depth(0);

        info!(
            forced = forced,
            discarded = discarded.len(),
            "Scheduler stopped"
        );

        ShutdownReport {
            forced,
            discarded_tasks: discarded.len(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if *self.shut_down.get_mut() {
            return;
        }

        self.queue.close();
        self.state.send_replace(RunState::Aborting);

        let tasks = self.tasks.get_mut();
        for handle in tasks.workers.drain(..) {
            handle.abort();
        }
        if let Some(evictor) = tasks.evictor.take() {
            evictor.abort();
        }

        warn!("Scheduler dropped without shutdown, worker tasks aborted");
    }
}

/// Extra time granted on top of the teardown timeout before workers are
/// aborted outright.
const ABORT_SLACK: Duration = Duration::from_millis(500);

fn log_worker_exits(results: Vec<Result<(), JoinError>>) {
    for result in results {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

fn spawn_evictor(
    store: Arc<ResultStore>,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
    mut state: watch::Receiver<RunState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_state(&mut state, |s| s != RunState::Running) => break,

                _ = ticker.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        metrics.record_evicted(evicted);
                        debug!(evicted = evicted, remaining = store.len(), "Evicted expired outcomes");
                    }
                }
            }
        }
    })
}
