//! Bounded in-memory task queue.
//!
//! The queue is a tokio `mpsc` channel shared by all workers:
//!
//! - `enqueue` never waits: it uses `try_send` and fails fast when full
//! - `dequeue` waits until a task is available or the queue is closed
//! - tasks are handed out in submission order
//!
//! A slot is released as soon as a worker dequeues the task, not when the
//! task finishes executing.

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use super::task::Task;

/// Errors that can occur when enqueueing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue already holds `capacity` tasks.
    #[error("Queue is full")]
    Full,

    /// The queue was closed by shutdown.
    #[error("Queue is closed")]
    Closed,
}

/// Fixed-capacity FIFO of pending tasks.
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
    closed: watch::Sender<bool>,
    capacity: usize,
}

impl TaskQueue {
    /// Creates a queue holding at most `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; configuration validation rejects that.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);

        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            capacity,
        }
    }

    /// Adds a task to the back of the queue without waiting.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Takes the task at the front of the queue.
    ///
    /// Waits until a task is available. Returns `None` once the queue has
    /// been closed, even if tasks are still buffered; those are collected by
    /// `drain`.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }

        tokio::select! {
            biased;

            _ = closed.wait_for(|closed| *closed) => None,

            task = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            } => task,
        }
    }

    /// Closes the queue: pending and future `dequeue` calls return `None` and
    /// `enqueue` fails with `QueueError::Closed`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Returns whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Removes and returns every task still buffered.
    pub async fn drain(&self) -> Vec<Task> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(task) = rx.try_recv() {
            drained.push(task);
        }
        drained
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of waiting tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
