//! Cluster-visible counter updated with compare-and-set.

use std::sync::Arc;
use std::time::Duration;

use ganglion_common::{GanglionError, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::backend::{CounterCell, LockBackend};

/// Bounded exponential backoff between compare-and-set attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(2000),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (1-based): the base delay times a
    /// random factor in `1..=2^attempt`, capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let ceiling = 1u32 << attempt.min(29);
        let factor = rand::rng().random_range(1..=ceiling);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct DistributedCounter {
    path: String,
    cell: Arc<dyn CounterCell>,
    policy: RetryPolicy,
}

impl DistributedCounter {
    /// Attach to the counter at `path`, creating it with `initial` if absent.
    pub async fn new(backend: &dyn LockBackend, path: &str, initial: i64) -> Result<Self> {
        let cell = backend.distributed_counter(path, initial).await?;
        Ok(Self::from_cell(path, cell))
    }

    pub fn from_cell(path: impl Into<String>, cell: Arc<dyn CounterCell>) -> Self {
        Self {
            path: path.into(),
            cell,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn get(&self) -> Result<i64> {
        self.cell
            .read()
            .await
            .map(|v| v.value)
            .map_err(|e| e.during(format!("read counter {}", self.path)))
    }

    /// Returns the value after the increment.
    pub async fn increment(&self) -> Result<i64> {
        self.add(1).await
    }

    /// Returns the value after the decrement.
    pub async fn decrement(&self) -> Result<i64> {
        self.add(-1).await
    }

    async fn add(&self, delta: i64) -> Result<i64> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match self.cell.read().await {
                Ok(current) => {
                    let Some(next) = current.value.checked_add(delta) else {
                        return Err(GanglionError::IllegalArgument(format!(
                            "counter {} cannot move past {} by {}",
                            self.path, current.value, delta
                        )));
                    };
                    self.cell
                        .compare_and_set(current, next)
                        .await
                        .map(|set| set.then_some(next))
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Some(value)) => {
                    debug!(path = %self.path, value, attempt, "Counter updated");
                    return Ok(value);
                }
                Ok(None) => {
                    debug!(path = %self.path, attempt, "Counter changed concurrently, retrying");
                }
                Err(e) if e.is_transient() => {
                    warn!(path = %self.path, attempt, error = %e, "Counter update failed, retrying");
                }
                Err(e) => return Err(e.during(format!("update counter {}", self.path))),
            }

            if attempt >= self.policy.max_attempts {
                return Err(GanglionError::CounterUpdate {
                    path: self.path.clone(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(self.policy.calculate_delay(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SingleProcessLockBackend;

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        for attempt in 1..=10 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay >= policy.base_delay);
            assert!(delay <= policy.max_delay);
        }
        // 10ms * 2^1 at most on the first retry
        assert!(policy.calculate_delay(1) <= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_increment_decrement_local() {
        let backend = SingleProcessLockBackend::new();
        let counter = DistributedCounter::new(&backend, "/sessions", 0).await.unwrap();

        assert_eq!(counter.increment().await.unwrap(), 1);
        assert_eq!(counter.increment().await.unwrap(), 2);
        assert_eq!(counter.decrement().await.unwrap(), 1);
        assert_eq!(counter.get().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overflow_rejected_and_value_kept() {
        let backend = SingleProcessLockBackend::new();
        let top = DistributedCounter::new(&backend, "/top", i64::MAX).await.unwrap();
        let bottom = DistributedCounter::new(&backend, "/bottom", i64::MIN).await.unwrap();

        assert!(matches!(
            top.increment().await,
            Err(GanglionError::IllegalArgument(_))
        ));
        assert!(matches!(
            bottom.decrement().await,
            Err(GanglionError::IllegalArgument(_))
        ));
        assert_eq!(top.get().await.unwrap(), i64::MAX);
        assert_eq!(top.decrement().await.unwrap(), i64::MAX - 1);
    }
}
