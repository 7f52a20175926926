//! Lock backends.
//!
//! A [`LockBackend`] supplies the three coordination primitives (named mutex,
//! leader election, integer counter) with a fixed guarantee level. The backend
//! is chosen once, when the lock service is built.

pub mod distributed;
pub mod local;
pub mod noop;
pub mod single_process;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::{Configuration, GanglionError, LockBackendKind, Result, TaskRegistry};
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::client::{CoordinationClient, CoordinationError, VersionedValue};
use crate::election::{ElectionSession, LeadershipEvent, LeadershipToken};
use crate::lock::LockHandle;

pub use distributed::DistributedLockBackend;
pub use local::LocalLockBackend;
pub use noop::NoOpLockBackend;
pub use single_process::SingleProcessLockBackend;

/// How far the exclusion of a backend's locks reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockGuarantee {
    /// Locks never block.
    None,
    /// Exclusion between callers of the same process only.
    ProcessLocal,
    /// Exclusion across every process sharing the coordination service.
    ClusterWide,
}

/// Backend-specific mutual exclusion primitive behind a [`LockHandle`].
#[async_trait]
pub trait MutexPrimitive: Send + Sync {
    /// Returns `false` when `timeout` elapsed before the lock was obtained.
    async fn acquire(&self, timeout: Option<Duration>) -> Result<bool>;

    async fn release(&self) -> Result<()>;
}

/// Integer cell updated with compare-and-set.
#[async_trait]
pub trait CounterCell: Send + Sync {
    async fn read(&self) -> Result<VersionedValue, CoordinationError>;

    /// Returns `false` when the value changed since `expected` was read.
    async fn compare_and_set(
        &self,
        expected: VersionedValue,
        new_value: i64,
    ) -> Result<bool, CoordinationError>;
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    fn kind(&self) -> LockBackendKind;

    fn guarantee(&self) -> LockGuarantee;

    /// A fresh handle for one acquisition of `name`.
    fn create_lock(&self, name: &str) -> LockHandle;

    /// Join the election `name`; events arrive on the returned session.
    async fn leader_election(&self, name: &str) -> Result<ElectionSession>;

    /// The counter at `path`, created with `initial` only if it does not exist.
    async fn distributed_counter(&self, path: &str, initial: i64) -> Result<Arc<dyn CounterCell>>;

    async fn delete_distributed_counter(&self, path: &str) -> Result<()>;

    /// Cancel elections and release every resource the backend holds.
    async fn shutdown(&self) -> Result<()>;
}

/// Build the backend selected by `ganglion.lock.backend`. The distributed
/// backend needs a coordination client.
pub fn build_backend(
    configuration: &Configuration,
    client: Option<Arc<dyn CoordinationClient>>,
) -> Result<Arc<dyn LockBackend>> {
    let kind = configuration.lock_backend()?;
    let backend: Arc<dyn LockBackend> = match kind {
        LockBackendKind::Distributed => {
            let client = client.ok_or_else(|| {
                GanglionError::Config(
                    "the distributed lock backend requires a coordination client".to_string(),
                )
            })?;
            Arc::new(DistributedLockBackend::from_configuration(
                client,
                configuration,
            ))
        }
        LockBackendKind::SingleProcess => Arc::new(SingleProcessLockBackend::new()),
        LockBackendKind::Local => Arc::new(LocalLockBackend::new()),
        LockBackendKind::NoOp => Arc::new(NoOpLockBackend::new()),
    };

    tracing::info!(backend = %kind, guarantee = ?backend.guarantee(), "Lock backend selected");
    Ok(backend)
}

/// Process-local mutex primitive over a tokio mutex. The guard is parked in
/// the primitive between `acquire` and `release`.
pub(crate) struct LocalMutex {
    mutex: Arc<tokio::sync::Mutex<()>>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl LocalMutex {
    pub(crate) fn new(mutex: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self {
            mutex,
            guard: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MutexPrimitive for LocalMutex {
    async fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let guard = match timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.mutex.clone().lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => return Ok(false),
                }
            }
            None => self.mutex.clone().lock_owned().await,
        };
        *self.guard.lock() = Some(guard);
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        self.guard.lock().take();
        Ok(())
    }
}

/// Process-local counter. Its version is the value itself.
pub(crate) struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub(crate) fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }
}

#[async_trait]
impl CounterCell for AtomicCounter {
    async fn read(&self) -> Result<VersionedValue, CoordinationError> {
        let value = self.value.load(Ordering::SeqCst);
        Ok(VersionedValue {
            value,
            version: value as u64,
        })
    }

    async fn compare_and_set(
        &self,
        expected: VersionedValue,
        new_value: i64,
    ) -> Result<bool, CoordinationError> {
        Ok(self
            .value
            .compare_exchange(
                expected.value,
                new_value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok())
    }
}

/// Elections for backends without a coordination service: a supervised task
/// makes the caller leader once and never revokes it before shutdown.
pub(crate) fn simulated_election(tasks: &TaskRegistry, name: &str) -> ElectionSession {
    let (tx, rx) = mpsc::unbounded_channel();
    let election = name.to_string();
    let leave = CancellationToken::new();
    let watcher_leave = leave.clone();

    tasks.spawn(format!("election:{}", name), move |token| async move {
        let granted = token.child_token();
        tracing::debug!(election = %election, "Simulated leadership granted");
        if tx
            .send(LeadershipEvent::Acquired(LeadershipToken::new(granted.clone())))
            .is_err()
        {
            return;
        }
        // Hold the sender until shutdown so the session does not read as closed.
        tokio::select! {
            _ = token.cancelled() => {}
            _ = watcher_leave.cancelled() => granted.cancel(),
        }
    });

    ElectionSession::new(name, rx, leave)
}
