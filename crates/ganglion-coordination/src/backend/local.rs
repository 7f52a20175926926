//! Call-site scoped locks.
//!
//! Every `create_lock` returns a brand new mutex, so the backend on its own
//! excludes nothing; exclusion between callers of one process comes from the
//! lock service's per-name mutex in front of it. Counters and elections behave
//! as in the single-process backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ganglion_common::{LockBackendKind, Result, TaskRegistry};
use tracing::info;

use super::{AtomicCounter, CounterCell, LocalMutex, LockBackend, LockGuarantee, simulated_election};
use crate::election::ElectionSession;
use crate::lock::LockHandle;

pub struct LocalLockBackend {
    counters: DashMap<String, Arc<AtomicCounter>>,
    tasks: TaskRegistry,
}

impl Default for LocalLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLockBackend {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            tasks: TaskRegistry::new(),
        }
    }
}

#[async_trait]
impl LockBackend for LocalLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::Local
    }

    fn guarantee(&self) -> LockGuarantee {
        LockGuarantee::ProcessLocal
    }

    fn create_lock(&self, name: &str) -> LockHandle {
        let mutex = Arc::new(tokio::sync::Mutex::new(()));
        LockHandle::new(name, Arc::new(LocalMutex::new(mutex)), None)
    }

    async fn leader_election(&self, name: &str) -> Result<ElectionSession> {
        Ok(simulated_election(&self.tasks, name))
    }

    async fn distributed_counter(&self, path: &str, initial: i64) -> Result<Arc<dyn CounterCell>> {
        let counter: Arc<dyn CounterCell> = self
            .counters
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(AtomicCounter::new(initial)))
            .clone();
        Ok(counter)
    }

    async fn delete_distributed_counter(&self, path: &str) -> Result<()> {
        self.counters.remove(path);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.tasks.shutdown(Duration::from_secs(1)).await;
        info!("Local lock backend shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_lock_is_independent() {
        let backend = LocalLockBackend::new();
        let first = backend.create_lock("a");
        let second = backend.create_lock("a");

        assert!(first.primitive().acquire(None).await.unwrap());
        assert!(
            second
                .primitive()
                .acquire(Some(Duration::from_millis(10)))
                .await
                .unwrap()
        );
    }
}
