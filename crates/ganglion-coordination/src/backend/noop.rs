//! Backend whose locks never block. Intended for tests and tooling that run
//! without any concurrency concerns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ganglion_common::{LockBackendKind, Result, TaskRegistry};

use super::{AtomicCounter, CounterCell, LockBackend, LockGuarantee, MutexPrimitive, simulated_election};
use crate::election::ElectionSession;
use crate::lock::LockHandle;

struct NoOpMutex;

#[async_trait]
impl MutexPrimitive for NoOpMutex {
    async fn acquire(&self, _timeout: Option<Duration>) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoOpLockBackend {
    counters: DashMap<String, Arc<AtomicCounter>>,
    tasks: TaskRegistry,
}

impl Default for NoOpLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NoOpLockBackend {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            tasks: TaskRegistry::new(),
        }
    }
}

#[async_trait]
impl LockBackend for NoOpLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::NoOp
    }

    fn guarantee(&self) -> LockGuarantee {
        LockGuarantee::None
    }

    fn create_lock(&self, name: &str) -> LockHandle {
        LockHandle::new(name, Arc::new(NoOpMutex), None)
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
        Ok(())
    }
}
