//! Task scheduling: a bounded queue served by a pool of session-owning
//! workers, with outcomes kept in a TTL store.
//!
//! - **TaskQueue**: fixed-capacity FIFO, fail-fast on overflow
//! - **ResultStore**: outcomes by task id, expiring after `result_ttl`
//! - **Worker**: dequeues tasks and executes them against its own session
//! - **Scheduler**: the facade tying them together (`put`, `get`, `shutdown`)
//!
//! # Architecture
//!
//! ```text
//!          put ──▶ ┌────────────┐         ┌─────────────┐ ◀── get
//!                  │ TaskQueue  │         │ ResultStore │
//!                  └─────┬──────┘         └──────▲──────┘
//!                        │ dequeue               │ record
//!         ┌──────────────┼──────────────┐        │
//!         ▼              ▼              ▼        │
//!    ┌─────────┐    ┌─────────┐    ┌─────────┐   │
//!    │ Worker 0│    │ Worker 1│    │ Worker N│ ──┘
//!    │ session │    │ session │    │ session │
//!    └─────────┘    └─────────┘    └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use activity_decoder::config::{ProcessSessionConfig, SchedulerConfig};
//! use activity_decoder::scheduler::Scheduler;
//! use activity_decoder::session::ProcessSessionFactory;
//!
//! let factory = Arc::new(ProcessSessionFactory::new(ProcessSessionConfig::new("driver")));
//! Scheduler::scope(SchedulerConfig::new(4), factory, |scheduler| async move {
//!     let task_id = scheduler.put(activity, None, Duration::ZERO)?;
//!     // ... poll scheduler.get(task_id)
//! })
//! .await?;
//! ```

pub mod queue;
pub mod service;
pub mod store;
pub mod task;
mod worker;

pub use queue::{QueueError, TaskQueue};
pub use service::{Scheduler, ShutdownReport};
pub use store::ResultStore;
pub use task::{DecodedActivity, FailureKind, Outcome, OutcomeStatus, Task, TaskFailure, TaskId};
pub use worker::RunState;
