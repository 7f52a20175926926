//! Lock service behaviour across backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::{GanglionError, LockBackendKind, Result};
use ganglion_coordination::backend::{CounterCell, MutexPrimitive};
use ganglion_coordination::{
    DistributedLockBackend, ElectionSession, InMemoryCoordinator, LockBackend, LockGuarantee,
    LockHandle, LockService, SingleProcessLockBackend,
};
use tokio::sync::{mpsc, oneshot};

/// Increment that would lose updates if two callers interleaved.
async fn racy_increment(counter: &AtomicI64, in_flight: &AtomicUsize, max_in_flight: &AtomicUsize) {
    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    max_in_flight.fetch_max(now, Ordering::SeqCst);

    let value = counter.load(Ordering::SeqCst);
    tokio::task::yield_now().await;
    counter.store(value + 1, Ordering::SeqCst);

    in_flight.fetch_sub(1, Ordering::SeqCst);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lockers_in_one_process_never_interleave() {
    let service = Arc::new(LockService::new(Arc::new(SingleProcessLockBackend::new())));
    let counter = Arc::new(AtomicI64::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let service = service.clone();
        let counter = counter.clone();
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        handles.push(tokio::spawn(async move {
            service
                .lock("L", || async move {
                    racy_increment(&counter, &in_flight, &max_in_flight).await
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 50);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_sharing_a_coordinator_never_interleave() {
    let coordinator = InMemoryCoordinator::new();
    let services: Vec<Arc<LockService>> = (0..3)
        .map(|_| {
            Arc::new(LockService::new(Arc::new(DistributedLockBackend::new(
                coordinator.connect(),
            ))))
        })
        .collect();

    let counter = Arc::new(AtomicI64::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..30 {
        let service = services[i % services.len()].clone();
        let counter = counter.clone();
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        handles.push(tokio::spawn(async move {
            service
                .lock("L", || async move {
                    racy_increment(&counter, &in_flight, &max_in_flight).await
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 30);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert!(coordinator.mutex_owner("/ganglion/locks/L").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_lock_names_deliver_every_message() {
    let coordinator = InMemoryCoordinator::new();
    let service = Arc::new(LockService::new(Arc::new(DistributedLockBackend::new(
        coordinator.connect(),
    ))));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handles = Vec::new();
    for i in 0..10 {
        let name = if i < 5 { "lockOne" } else { "lockTwo" };
        let service = service.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            service
                .lock_run(name, move || {
                    tx.send(format!("{} from worker {}", name, i)).unwrap();
                })
                .await
        }));
    }
    drop(tx);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    assert_eq!(messages.len(), 10);
    assert_eq!(messages.iter().filter(|m| m.starts_with("lockOne")).count(), 5);
}

#[tokio::test(start_paused = true)]
async fn distributed_lock_times_out_without_running_the_closure() {
    let coordinator = InMemoryCoordinator::new();
    let holder = Arc::new(LockService::new(Arc::new(DistributedLockBackend::new(
        coordinator.connect(),
    ))));
    let contender = LockService::new(Arc::new(DistributedLockBackend::new(coordinator.connect())));

    let (locked_tx, locked_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let holding = tokio::spawn({
        let holder = holder.clone();
        async move {
            holder
                .lock("L", || async move {
                    locked_tx.send(()).unwrap();
                    let _ = release_rx.await;
                })
                .await
        }
    });
    locked_rx.await.unwrap();

    let started = tokio::time::Instant::now();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let result = contender
        .lock("L", || async move { flag.store(true, Ordering::SeqCst) })
        .await;

    match result {
        Err(GanglionError::LockTimeout { name, timeout }) => {
            assert_eq!(name, "L");
            assert_eq!(timeout, Duration::from_secs(30));
        }
        other => panic!("expected a lock timeout, got {:?}", other.map(|_| ())),
    }
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(!ran.load(Ordering::SeqCst));

    release_tx.send(()).unwrap();
    holding.await.unwrap().unwrap();
}

#[tokio::test]
async fn coordination_failures_are_returned() {
    let coordinator = InMemoryCoordinator::new();
    let service = LockService::new(Arc::new(DistributedLockBackend::new(coordinator.connect())));
    coordinator.fail_next_operations(1);

    let result = service.lock("L", || async { 1 }).await;
    assert!(matches!(result, Err(GanglionError::Coordination { .. })));

    // the service recovers once the connection does
    assert_eq!(service.lock("L", || async { 2 }).await.unwrap(), 2);
}

/// Wraps a backend and records how many handles for a name are outstanding at once.
struct CountingBackend {
    inner: SingleProcessLockBackend,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

struct CountingMutex {
    inner: Arc<dyn MutexPrimitive>,
    outstanding: Arc<AtomicUsize>,
}

#[async_trait]
impl MutexPrimitive for CountingMutex {
    async fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.acquire(timeout).await
    }

    async fn release(&self) -> Result<()> {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.inner.release().await
    }
}

#[async_trait]
impl LockBackend for CountingBackend {
    fn kind(&self) -> LockBackendKind {
        self.inner.kind()
    }

    fn guarantee(&self) -> LockGuarantee {
        self.inner.guarantee()
    }

    fn create_lock(&self, name: &str) -> LockHandle {
        self.created.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);

        let handle = self.inner.create_lock(name);
        LockHandle::new(
            name,
            Arc::new(CountingMutex {
                inner: handle.primitive().clone(),
                outstanding: self.outstanding.clone(),
            }),
            None,
        )
    }

    async fn leader_election(&self, name: &str) -> Result<ElectionSession> {
        self.inner.leader_election(name).await
    }

    async fn distributed_counter(&self, path: &str, initial: i64) -> Result<Arc<dyn CounterCell>> {
        self.inner.distributed_counter(path, initial).await
    }

    async fn delete_distributed_counter(&self, path: &str) -> Result<()> {
        self.inner.delete_distributed_counter(path).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_process_callers_reach_the_backend_one_at_a_time() {
    let backend = Arc::new(CountingBackend {
        inner: SingleProcessLockBackend::new(),
        outstanding: Arc::new(AtomicUsize::new(0)),
        max_outstanding: Arc::new(AtomicUsize::new(0)),
        created: Arc::new(AtomicUsize::new(0)),
    });
    let service = Arc::new(LockService::new(backend.clone()));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .lock("L", || async {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(backend.created.load(Ordering::SeqCst), 20);
    assert_eq!(backend.max_outstanding.load(Ordering::SeqCst), 1);
    assert_eq!(backend.outstanding.load(Ordering::SeqCst), 0);
}
