//! Backend for deployments where every worker lives in one process.
//!
//! All locks with the same name share one mutex for the lifetime of the
//! backend, counters are plain atomics and every election participant is
//! made leader straight away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ganglion_common::{LockBackendKind, Result, TaskRegistry};
use tracing::info;

use super::{AtomicCounter, CounterCell, LocalMutex, LockBackend, LockGuarantee, simulated_election};
use crate::election::ElectionSession;
use crate::lock::LockHandle;

pub struct SingleProcessLockBackend {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    counters: DashMap<String, Arc<AtomicCounter>>,
    tasks: TaskRegistry,
}

impl Default for SingleProcessLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleProcessLockBackend {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            counters: DashMap::new(),
            tasks: TaskRegistry::new(),
        }
    }
}

#[async_trait]
impl LockBackend for SingleProcessLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::SingleProcess
    }

    fn guarantee(&self) -> LockGuarantee {
        LockGuarantee::ProcessLocal
    }

    fn create_lock(&self, name: &str) -> LockHandle {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
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
        info!("Single-process lock backend shut down");
        Ok(())
    }
}
