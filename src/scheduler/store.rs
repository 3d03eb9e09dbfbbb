//! Time-to-live result store.
//!
//! Every id handed out by `Scheduler::put` is registered here as pending
//! before its task is enqueued, so a lookup can tell three cases apart:
//!
//! - unknown or expired id: `GetError::TaskIdNotFound`
//! - registered but not finished: `GetError::TaskNotCompleted`
//! - finished and not expired: the recorded `Outcome`
//!
//! Expiry is enforced on lookup and by `evict_expired`, which the scheduler
//! runs periodically. Lookups and eviction share one `RwLock`, so a read is
//! never interleaved with the removal of the entry it reads.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::GetError;

use super::task::{Outcome, TaskId};

/// Entry of the result store.
#[derive(Debug, Clone)]
enum Entry {
    /// Task accepted, no outcome yet.
    Pending,
    /// Outcome recorded; unreachable after `expires_at`.
    Ready { outcome: Outcome, expires_at: Instant },
}

/// Thread-safe TTL cache of task outcomes.
pub struct ResultStore {
    entries: RwLock<HashMap<TaskId, Entry>>,
    ttl: Duration,
}

impl ResultStore {
    /// Creates an empty store whose outcomes live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns the outcome time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Marks `task_id` as accepted but not yet completed.
    pub fn register(&self, task_id: TaskId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(task_id, Entry::Pending);
    }

    /// Removes a registration, used when the task could not be enqueued.
    pub fn forget(&self, task_id: TaskId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&task_id);
    }

    /// Records the outcome of a task, replacing its pending marker.
    pub fn record(&self, outcome: Outcome) {
        let expires_at = Instant::now()
            .checked_add(self.ttl)
            .unwrap_or_else(far_future);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(outcome.task_id, Entry::Ready { outcome, expires_at });
    }

    /// Looks up the outcome of a task.
    pub fn lookup(&self, task_id: TaskId) -> Result<Outcome, GetError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&task_id) {
            None => Err(GetError::TaskIdNotFound(task_id)),
            Some(Entry::Pending) => Err(GetError::TaskNotCompleted(task_id)),
            Some(Entry::Ready { outcome, expires_at }) => {
                if Instant::now() >= *expires_at {
                    Err(GetError::TaskIdNotFound(task_id))
                } else {
                    Ok(outcome.clone())
                }
            }
        }
    }

    /// Removes every expired outcome and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Pending => true,
            Entry::Ready { expires_at, .. } => *expires_at > now,
        });
        before - entries.len()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    /// Returns the number of entries, pending ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of tasks registered without an outcome.
    pub fn pending(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| matches!(entry, Entry::Pending))
            .count()
    }
}

// Roughly thirty years; used when `ttl` overflows the clock.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
