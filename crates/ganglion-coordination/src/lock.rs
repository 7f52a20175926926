//! Named locks with a per-process collapsing layer in front of the backend.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use ganglion_common::{Configuration, GanglionError, Result};
use tracing::{debug, warn};

use crate::backend::{LockBackend, LockGuarantee, MutexPrimitive, build_backend};
use crate::client::CoordinationClient;

/// How long a distributed lock waits for its holder before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// One acquisition of a named lock, created by [`LockBackend::create_lock`].
pub struct LockHandle {
    name: String,
    primitive: Arc<dyn MutexPrimitive>,
    acquire_timeout: Option<Duration>,
}

/// Releases the primitive if the future running under the lock is dropped
/// before it finishes.
struct ReleaseOnDrop {
    name: String,
    primitive: Option<Arc<dyn MutexPrimitive>>,
}

impl ReleaseOnDrop {
    async fn release(mut self) -> Result<()> {
        match self.primitive.take() {
            Some(primitive) => primitive.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(primitive) = self.primitive.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = primitive.release().await {
                        warn!(lock = %name, error = %e, "Release after cancellation failed");
                    }
                });
            }
            Err(_) => warn!(lock = %name, "Lock dropped outside a runtime, not released"),
        }
    }
}

impl LockHandle {
    pub fn new(
        name: impl Into<String>,
        primitive: Arc<dyn MutexPrimitive>,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            primitive,
            acquire_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primitive(&self) -> &Arc<dyn MutexPrimitive> {
        &self.primitive
    }

    /// Acquire, run `f`, release. The lock is released even if `f` panics;
    /// the panic is resumed afterwards. When the acquire times out `f` is
    /// never called.
    pub async fn run<F, Fut, T>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        if !self.primitive.acquire(self.acquire_timeout).await? {
            return Err(GanglionError::LockTimeout {
                name: self.name,
                timeout: self.acquire_timeout.unwrap_or_default(),
            });
        }
        debug!(lock = %self.name, "Lock acquired");

        let guard = ReleaseOnDrop {
            name: self.name.clone(),
            primitive: Some(self.primitive.clone()),
        };
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        let released = guard.release().await;
        debug!(lock = %self.name, "Lock released");

        match outcome {
            Ok(value) => released.map(|_| value),
            Err(panic) => {
                if let Err(e) = released {
                    warn!(lock = %self.name, error = %e, "Release after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Holds the process-local mutex of one name. On every exit path the mutex is
/// unlocked and its map entry dropped once no other caller references it.
struct LocalSlot<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    name: &'a str,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for LocalSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.name, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Lock service: callers in one process contending for the same name queue on
/// a local mutex first, so at most one of them talks to the backend at a time.
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    local_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl LockService {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            local_locks: DashMap::new(),
        }
    }

    /// Build with the backend named in the configuration. When the deployment
    /// is marked clustered, a backend weaker than cluster-wide is rejected.
    pub fn from_configuration(
        configuration: &Configuration,
        client: Option<Arc<dyn CoordinationClient>>,
    ) -> Result<Self> {
        let service = Self::new(build_backend(configuration, client)?);
        if configuration.is_clustered() {
            service.require_cluster_wide()?;
        }
        Ok(service)
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    pub fn guarantee(&self) -> LockGuarantee {
        self.backend.guarantee()
    }

    pub fn require_cluster_wide(&self) -> Result<()> {
        let guarantee = self.backend.guarantee();
        if guarantee < LockGuarantee::ClusterWide {
            return Err(GanglionError::Config(format!(
                "lock backend '{}' only provides {:?} exclusion, cluster-wide is required",
                self.backend.kind(),
                guarantee
            )));
        }
        Ok(())
    }

    fn local_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.local_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock `name` and return its result.
    pub async fn lock<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let _local = LocalSlot {
            locks: &self.local_locks,
            name,
            guard: Some(self.local_lock(name).lock_owned().await),
        };
        self.backend.create_lock(name).run(f).await
    }

    /// Run a synchronous side effect while holding the lock `name`.
    pub async fn lock_run<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send,
    {
        self.lock(name, || async move { f() }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.backend.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NoOpLockBackend, SingleProcessLockBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_lock_returns_value() {
        let service = LockService::new(Arc::new(SingleProcessLockBackend::new()));
        let value = service.lock("a", || async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_lock_run_side_effect() {
        let service = LockService::new(Arc::new(NoOpLockBackend::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        service
            .lock_run("a", move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_after_panic() {
        let service = Arc::new(LockService::new(Arc::new(SingleProcessLockBackend::new())));

        let panicking = service.clone();
        let result = tokio::spawn(async move {
            panicking
                .lock("a", || async {
                    panic!("boom");
                })
                .await
        })
        .await;
        assert!(result.unwrap_err().is_panic());

        let value = tokio::time::timeout(
            Duration::from_secs(1),
            service.lock("a", || async { "free" }),
        )
        .await
        .expect("lock should be free after a panic")
        .unwrap();
        assert_eq!(value, "free");
    }

    #[tokio::test]
    async fn test_local_entries_dropped_when_idle() {
        let service = Arc::new(LockService::new(Arc::new(SingleProcessLockBackend::new())));
        for n in 0..100 {
            service.lock(&format!("lock-{}", n), || async {}).await.unwrap();
        }
        assert!(service.local_locks.is_empty());

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (leave_tx, leave_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = service.clone();
        let held = tokio::spawn(async move {
            holder
                .lock("busy", || async move {
                    let _ = entered_tx.send(());
                    let _ = leave_rx.await;
                })
                .await
        });
        entered_rx.await.unwrap();
        assert!(service.local_locks.contains_key("busy"));

        leave_tx.send(()).unwrap();
        held.await.unwrap().unwrap();
        assert!(service.local_locks.is_empty());

        let panicking = service.clone();
        let result = tokio::spawn(async move {
            panicking
                .lock("boom", || async {
                    panic!("boom");
                })
                .await
        })
        .await;
        assert!(result.unwrap_err().is_panic());
        assert!(service.local_locks.is_empty());
    }

    #[tokio::test]
    async fn test_require_cluster_wide() {
        let service = LockService::new(Arc::new(SingleProcessLockBackend::new()));
        assert_eq!(service.guarantee(), LockGuarantee::ProcessLocal);
        assert!(matches!(
            service.require_cluster_wide(),
            Err(GanglionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_from_configuration_rejects_local_backend_when_clustered() {
        let configuration = Configuration::from_pairs([
            (ganglion_common::config::LOCK_BACKEND, "local"),
            (ganglion_common::config::CLUSTERED, "true"),
        ])
        .unwrap();
        assert!(LockService::from_configuration(&configuration, None).is_err());

        let configuration =
            Configuration::from_pairs([(ganglion_common::config::LOCK_BACKEND, "local")]).unwrap();
        let service = LockService::from_configuration(&configuration, None).unwrap();
        assert_eq!(
            service.backend().kind(),
            ganglion_common::LockBackendKind::Local
        );
    }

    #[tokio::test]
    async fn test_distributed_backend_requires_client() {
        let configuration = Configuration::default();
        assert!(matches!(
            LockService::from_configuration(&configuration, None),
            Err(GanglionError::Config(_))
        ));
    }
}
