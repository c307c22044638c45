//! Bounded-concurrency FIFO admission for calls into the generation backend.
//!
//! [`AdmissionQueue::submit`] never blocks: the admission decision is made
//! synchronously under the queue lock, and the work itself runs on a spawned
//! task. A task that finishes (or panics) hands its slot straight to the
//! oldest waiter, so a later submission can never overtake an earlier one.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queued task panicked: {0}")]
    TaskPanicked(String),
    #[error("queued task was cancelled before it completed")]
    Cancelled,
    #[error("queued task lost its slot hand-off")]
    Abandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active_count: usize,
    pub queued_count: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Shared {
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

enum Admission {
    Run,
    Wait(oneshot::Receiver<()>),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Admission {
        let mut state = self.lock();
        if state.active < self.max_concurrent {
            state.active += 1;
            return Admission::Run;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Admission::Wait(rx)
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            // A closed receiver belongs to a waiter whose runtime went away.
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// Held by a running task. Dropping it, including during a panic unwind,
/// frees the slot.
struct SlotGuard {
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[derive(Debug)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    /// `max_concurrent` below 1 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// Schedules `task` and returns immediately. The closure is only invoked
    /// once a slot is held. Must be called from within a Tokio runtime.
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let admission = self.shared.admit();
        let shared = self.shared.clone();
        if let Admission::Wait(_) = admission {
            let status = self.status();
            tracing::debug!(
                active = status.active_count,
                queued = status.queued_count,
                "generation task queued"
            );
        }

        let join = tokio::spawn(async move {
            if let Admission::Wait(slot) = admission {
                if slot.await.is_err() {
                    return Err(QueueError::Abandoned);
                }
            }
            let _slot = SlotGuard { shared };
            Ok(task().await)
        });
        TaskHandle { join }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus {
            active_count: state.active,
            queued_count: state.waiters.len(),
            max_concurrent: self.shared.max_concurrent,
        }
    }
}

/// Completion handle for a submitted task. Dropping it detaches the task; it
/// still runs to completion.
#[derive(Debug)]
pub struct TaskHandle<T> {
    join: JoinHandle<Result<T, QueueError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(|joined| match joined {
            Ok(output) => output,
            Err(err) if err.is_panic() => Err(QueueError::TaskPanicked(panic_message(
                err.into_panic(),
            ))),
            Err(_) => Err(QueueError::Cancelled),
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
