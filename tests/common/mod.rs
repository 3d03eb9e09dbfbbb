//! Fake sessions and helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use activity_decoder::config::SchedulerConfig;
use activity_decoder::scheduler::{DecodedActivity, Outcome, Scheduler, Task, TaskId};
use activity_decoder::session::{Session, SessionError, SessionFactory, SessionOptions};
use activity_decoder::GetError;
use async_trait::async_trait;
use tokio::sync::Semaphore;

/// What a fake session does with each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Returns a description of the task and the session.
    Echo,
    /// Fails as if the external process had died.
    Crash,
    /// Rejects the activity; the session stays usable.
    RejectInput,
    /// Never answers.
    Hang,
    /// Blocks its runtime thread for the factory delay, then echoes.
    Block,
}

/// Construction and teardown counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub create_attempts: AtomicUsize,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub executed: AtomicUsize,
    pub started: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Sessions dropped, whether destroyed or abandoned.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Sessions constructed and not yet torn down.
    pub fn alive(&self) -> usize {
        self.created() - self.destroyed()
    }
}

pub struct FakeSession {
    worker_id: usize,
    generation: usize,
    behavior: Behavior,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(
        &mut self,
        task: &Task,
        _timeout: Duration,
    ) -> Result<DecodedActivity, SessionError> {
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| SessionError::Crashed(e.to_string()))?;
            permit.forget();
        }
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        if self.behavior == Behavior::Block {
            std::thread::sleep(self.delay);
        } else {
            tokio::time::sleep(self.delay).await;
        }
        self.counters.executed.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            Behavior::Echo | Behavior::Block => Ok(serde_json::json!({
                "worker_id": self.worker_id,
                "generation": self.generation,
                "bytes": task.activity.len(),
                "has_password": task.password.is_some(),
            })),
            Behavior::Crash => Err(SessionError::Crashed("helper exited".to_string())),
            Behavior::RejectInput => Err(SessionError::BadInput("wrong password".to_string())),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn destroy(self: Box<Self>) -> Result<(), SessionError> {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing `FakeSession`s.
pub struct FakeFactory {
    pub counters: Arc<Counters>,
    behavior: Behavior,
    delay: Duration,
    failures_before_success: usize,
    create_gate: Option<Arc<Semaphore>>,
    execute_gate: Option<Arc<Semaphore>>,
}

impl FakeFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            behavior,
            delay: Duration::ZERO,
            failures_before_success: 0,
            create_gate: None,
            execute_gate: None,
        }
    }

    /// Every execution sleeps `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `failures` constructions fail.
    pub fn with_failures(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    /// Each construction takes a permit from `gate`.
    pub fn with_create_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.create_gate = Some(gate);
        self
    }

    /// Each execution takes a permit from `gate`.
    pub fn with_execute_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.execute_gate = Some(gate);
        self
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn create(&self, options: &SessionOptions) -> Result<Box<dyn Session>, SessionError> {
        let attempt = self.counters.create_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            return Err(SessionError::Startup("display unavailable".to_string()));
        }

        if let Some(gate) = &self.create_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| SessionError::Startup(e.to_string()))?;
            permit.forget();
        }

        let generation = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeSession {
            worker_id: options.worker_id,
            generation,
            behavior: self.behavior,
            delay: self.delay,
            gate: self.execute_gate.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Small, fast configuration for tests.
pub fn test_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::new(workers)
        .with_queue_size(16)
        .with_virtual_display(false)
        .with_read_file_timeout(Duration::from_secs(1))
        .with_result_ttl(Duration::from_secs(60))
        .with_shutdown_grace(Duration::from_secs(2))
        .with_session_teardown_timeout(Duration::from_secs(1))
        .with_session_start_timeout(Duration::from_secs(2))
        .with_session_retry(Duration::from_millis(10), Duration::from_millis(50))
        .with_eviction_interval(Duration::from_millis(50))
}

/// Starts a scheduler over `factory`, returning the factory counters too.
pub fn start(config: SchedulerConfig, factory: FakeFactory) -> (Scheduler, Arc<Counters>) {
    let counters = Arc::clone(&factory.counters);
    let scheduler = Scheduler::start(config, Arc::new(factory)).expect("scheduler should start");
    (scheduler, counters)
}

/// Polls `get` until the task has an outcome (or has expired).
pub async fn wait_outcome(scheduler: &Scheduler, task_id: TaskId) -> Result<Outcome, GetError> {
    let poll = async {
        loop {
            match scheduler.get(task_id) {
                Err(GetError::TaskNotCompleted(_)) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                result => return result,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("task should finish within 10s")
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), poll).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}
