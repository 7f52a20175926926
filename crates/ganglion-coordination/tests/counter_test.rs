//! Distributed counter retries and cluster visibility.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::GanglionError;
use ganglion_coordination::backend::CounterCell;
use ganglion_coordination::client::VersionedValue;
use ganglion_coordination::{
    CoordinationError, DistributedCounter, DistributedLockBackend, InMemoryCoordinator,
    LockBackend, RetryPolicy,
};
use parking_lot::Mutex;

/// Cell whose first `failures` compare-and-set calls lose the race.
struct FlakyCell {
    value: Mutex<VersionedValue>,
    failures: AtomicU32,
}

#[async_trait]
impl CounterCell for FlakyCell {
    async fn read(&self) -> Result<VersionedValue, CoordinationError> {
        Ok(*self.value.lock())
    }

    async fn compare_and_set(
        &self,
        expected: VersionedValue,
        new_value: i64,
    ) -> Result<bool, CoordinationError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }

        let mut value = self.value.lock();
        if value.version != expected.version {
            return Ok(false);
        }
        *value = VersionedValue {
            value: new_value,
            version: value.version + 1,
        };
        Ok(true)
    }
}

#[tokio::test(start_paused = true)]
async fn two_conflicts_then_success() {
    let cell = Arc::new(FlakyCell {
        value: Mutex::new(VersionedValue { value: 7, version: 0 }),
        failures: AtomicU32::new(2),
    });
    let counter = DistributedCounter::from_cell("/c", cell.clone());

    assert_eq!(counter.increment().await.unwrap(), 8);
    assert_eq!(cell.failures.load(Ordering::SeqCst), 0);
    assert_eq!(counter.get().await.unwrap(), 8);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_counter_update() {
    let cell = Arc::new(FlakyCell {
        value: Mutex::new(VersionedValue { value: 0, version: 0 }),
        failures: AtomicU32::new(u32::MAX),
    });
    let counter = DistributedCounter::from_cell("/c", cell);

    match counter.decrement().await {
        Err(GanglionError::CounterUpdate { path, attempts }) => {
            assert_eq!(path, "/c");
            assert_eq!(attempts, 5);
        }
        other => panic!("expected CounterUpdate, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn connection_loss_is_retried() {
    let coordinator = InMemoryCoordinator::new();
    let backend = DistributedLockBackend::new(coordinator.connect());
    let counter = DistributedCounter::new(&backend, "/counters/sessions", 10)
        .await
        .unwrap();

    coordinator.fail_next_operations(2);
    assert_eq!(counter.increment().await.unwrap(), 11);
    assert_eq!(coordinator.value("/counters/sessions").unwrap().value, 11);
}

#[tokio::test]
async fn missing_counter_is_not_retried() {
    let coordinator = InMemoryCoordinator::new();
    let backend = DistributedLockBackend::new(coordinator.connect());
    let counter = DistributedCounter::new(&backend, "/counters/gone", 0)
        .await
        .unwrap();

    backend
        .delete_distributed_counter("/counters/gone")
        .await
        .unwrap();
    assert!(matches!(
        counter.increment().await,
        Err(GanglionError::Coordination { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn increments_from_several_sessions_add_up() {
    let coordinator = InMemoryCoordinator::new();
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: 200,
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let backend = DistributedLockBackend::new(coordinator.connect());
        let counter = DistributedCounter::new(&backend, "/counters/shared", 0)
            .await
            .unwrap()
            .with_retry_policy(policy);
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                counter.increment().await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(coordinator.value("/counters/shared").unwrap().value, 40);
}

#[tokio::test]
async fn existing_value_wins_over_initial() {
    let coordinator = InMemoryCoordinator::new();
    let first = DistributedLockBackend::new(coordinator.connect());
    let second = DistributedLockBackend::new(coordinator.connect());

    let a = DistributedCounter::new(&first, "/counters/x", 5).await.unwrap();
    a.increment().await.unwrap();

    let b = DistributedCounter::new(&second, "/counters/x", 0).await.unwrap();
    assert_eq!(b.get().await.unwrap(), 6);
    assert_eq!(b.decrement().await.unwrap(), 5);
    assert_eq!(a.get().await.unwrap(), 5);
}
