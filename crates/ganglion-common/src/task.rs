//! Supervised background tasks.
//!
//! Every long-lived task (election dispatch, broadcast listener, simulated
//! leadership) is spawned through a [`TaskRegistry`]. The registry hands each
//! task a child of its root [`CancellationToken`]; `shutdown` cancels the root,
//! joins every task and aborts whatever is still running after the grace period.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct TrackedTask {
    id: u64,
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct TaskRegistry {
    token: CancellationToken,
    tasks: Arc<Mutex<Vec<TrackedTask>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Token cancelled when the registry shuts down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a named task. The closure receives a token that is cancelled on
    /// shutdown; the task is expected to return promptly once it fires.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let child = self.token.child_token();
        let handle = tokio::spawn(f(child));

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        debug!(task = %name, id, "Spawned supervised task");
        tasks.push(TrackedTask { id, name, handle });
        id
    }

    /// Abort one task without touching the others.
    pub fn abort(&self, id: u64) -> bool {
        let mut tasks = self.tasks.lock();
        if let Some(pos) = tasks.iter().position(|t| t.id == id) {
            let task = tasks.remove(pos);
            task.handle.abort();
            debug!(task = %task.name, id, "Aborted supervised task");
            return true;
        }
        false
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Cancel every task and wait for them, aborting stragglers after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();

        let tasks: Vec<TrackedTask> = std::mem::take(&mut *self.tasks.lock());
        let total = tasks.len();

        for task in tasks {
            let TrackedTask { id, name, handle } = task;
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!(task = %name, id, "Supervised task stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = %name, id, error = %e, "Supervised task panicked"),
                Err(_) => {
                    abort.abort();
                    warn!(task = %name, id, "Supervised task did not stop in time, aborted");
                }
            }
        }

        info!(tasks = total, "Task registry shut down");
    }
}
