//! activity-decoder: decodes activity files on a pool of restartable GUI
//! automation sessions.
//!
//! The core is the `Scheduler`: a bounded task queue, a fixed pool of
//! workers each owning one session, and a TTL store of outcomes. Callers
//! submit work with `put` and poll for results with `get`.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use error::{ClientError, ConfigError, GetError, PutError, ServerError, StartError};
pub use scheduler::{Outcome, OutcomeStatus, Scheduler, ShutdownReport, TaskId};
