//! Coordination-service backed locks, leader latches and counters.
//!
//! Lock `name` maps to the mutex node `{lock prefix}/{name}` and election
//! `name` to the latch `{leader prefix}/{name}`, so every process configured
//! with the same prefixes contends on the same resources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::config::{DEFAULT_LEADER_PATH_PREFIX, DEFAULT_LOCK_PATH_PREFIX};
use ganglion_common::{Configuration, LockBackendKind, Result, TaskRegistry};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CounterCell, LockBackend, LockGuarantee, MutexPrimitive};
use crate::client::{CoordinationClient, CoordinationError, VersionedValue};
use crate::election::{ElectionSession, LeadershipEvent, LeadershipToken};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, LockHandle};

pub struct DistributedLockBackend {
    client: Arc<dyn CoordinationClient>,
    lock_prefix: String,
    leader_prefix: String,
    tasks: TaskRegistry,
    shutdown_grace: Duration,
}

impl DistributedLockBackend {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self::with_prefixes(client, DEFAULT_LOCK_PATH_PREFIX, DEFAULT_LEADER_PATH_PREFIX)
    }

    pub fn with_prefixes(
        client: Arc<dyn CoordinationClient>,
        lock_prefix: &str,
        leader_prefix: &str,
    ) -> Self {
        Self {
            client,
            lock_prefix: lock_prefix.trim_end_matches('/').to_string(),
            leader_prefix: leader_prefix.trim_end_matches('/').to_string(),
            tasks: TaskRegistry::new(),
            shutdown_grace: Duration::from_millis(ganglion_common::config::DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    pub fn from_configuration(
        client: Arc<dyn CoordinationClient>,
        configuration: &Configuration,
    ) -> Self {
        let mut backend = Self::with_prefixes(
            client,
            &configuration.lock_path_prefix(),
            &configuration.leader_path_prefix(),
        );
        backend.shutdown_grace = configuration.shutdown_grace();
        backend
    }

    pub fn lock_path(&self, name: &str) -> String {
        format!("{}/{}", self.lock_prefix, name)
    }

    pub fn election_path(&self, name: &str) -> String {
        format!("{}/{}", self.leader_prefix, name)
    }

    pub fn session_id(&self) -> &str {
        self.client.session_id()
    }
}

/// One acquisition of a coordination-service mutex.
struct DistributedMutex {
    client: Arc<dyn CoordinationClient>,
    path: String,
    owner: String,
}

#[async_trait]
impl MutexPrimitive for DistributedMutex {
    async fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        self.client
            .acquire_mutex(&self.path, &self.owner, timeout)
            .await
            .map_err(|e| e.during(format!("acquire {}", self.path)))
    }

    async fn release(&self) -> Result<()> {
        self.client
            .release_mutex(&self.path, &self.owner)
            .await
            .map_err(|e| e.during(format!("release {}", self.path)))
    }
}

struct DistributedCounterCell {
    client: Arc<dyn CoordinationClient>,
    path: String,
}

#[async_trait]
impl CounterCell for DistributedCounterCell {
    async fn read(&self) -> Result<VersionedValue, CoordinationError> {
        self.client
            .read_value(&self.path)
            .await?
            .ok_or_else(|| CoordinationError::NoNode(self.path.clone()))
    }

    async fn compare_and_set(
        &self,
        expected: VersionedValue,
        new_value: i64,
    ) -> Result<bool, CoordinationError> {
        Ok(self
            .client
            .compare_and_set_value(&self.path, expected.version, new_value)
            .await?
            .is_some())
    }
}

/// Translate latch state changes into leadership events until the session
/// leaves, the latch closes or the backend shuts down.
async fn watch_latch(
    client: Arc<dyn CoordinationClient>,
    path: String,
    participant: String,
    mut latch: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<LeadershipEvent>,
    token: CancellationToken,
    leave: CancellationToken,
) {
    let mut current: Option<CancellationToken> = None;

    loop {
        let is_leader = *latch.borrow_and_update();
        match (is_leader, current.is_some()) {
            (true, false) => {
                let leadership = token.child_token();
                current = Some(leadership.clone());
                info!(path = %path, participant = %participant, "Leadership acquired");
                let _ = events.send(LeadershipEvent::Acquired(LeadershipToken::new(leadership)));
            }
            (false, true) => {
                if let Some(leadership) = current.take() {
                    leadership.cancel();
                }
                info!(path = %path, participant = %participant, "Leadership lost");
                let _ = events.send(LeadershipEvent::Lost);
            }
            _ => {}
        }

        tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = client.leave_election(&path, &participant).await {
                    debug!(path = %path, error = %e, "Leaving election on shutdown failed");
                }
                return;
            }
            _ = leave.cancelled() => {
                if let Some(leadership) = current.take() {
                    leadership.cancel();
                }
                if let Err(e) = client.leave_election(&path, &participant).await {
                    warn!(path = %path, error = %e, "Leaving election failed");
                }
                info!(path = %path, participant = %participant, "Left election");
                return;
            }
            changed = latch.changed() => {
                if changed.is_err() {
                    // The latch went away with the session.
                    if let Some(leadership) = current.take() {
                        leadership.cancel();
                        warn!(path = %path, participant = %participant, "Leadership lost with session");
                        let _ = events.send(LeadershipEvent::Lost);
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl LockBackend for DistributedLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::Distributed
    }

    fn guarantee(&self) -> LockGuarantee {
        LockGuarantee::ClusterWide
    }

    fn create_lock(&self, name: &str) -> LockHandle {
        let owner = format!("{}:{}", self.client.session_id(), uuid::Uuid::new_v4());
        let primitive = DistributedMutex {
            client: self.client.clone(),
            path: self.lock_path(name),
            owner,
        };
        LockHandle::new(name, Arc::new(primitive), Some(DEFAULT_LOCK_TIMEOUT))
    }

    async fn leader_election(&self, name: &str) -> Result<ElectionSession> {
        let path = self.election_path(name);
        let participant = format!("{}:{}", self.client.session_id(), uuid::Uuid::new_v4());
        let latch = self
            .client
            .join_election(&path, &participant)
            .await
            .map_err(|e| e.during(format!("join election {}", path)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let leave = CancellationToken::new();
        let client = self.client.clone();
        let watcher_leave = leave.clone();
        self.tasks
            .spawn(format!("election:{}", name), move |token| {
                watch_latch(client, path, participant, latch, tx, token, watcher_leave)
            });

        Ok(ElectionSession::new(name, rx, leave))
    }

    async fn distributed_counter(&self, path: &str, initial: i64) -> Result<Arc<dyn CounterCell>> {
        self.client
            .create_value_if_absent(path, initial)
            .await
            .map_err(|e| e.during(format!("create counter {}", path)))?;

        Ok(Arc::new(DistributedCounterCell {
            client: self.client.clone(),
            path: path.to_string(),
        }))
    }

    async fn delete_distributed_counter(&self, path: &str) -> Result<()> {
        self.client
            .delete_value(path)
            .await
            .map_err(|e| e.during(format!("delete counter {}", path)))
    }

    async fn shutdown(&self) -> Result<()> {
        self.tasks.shutdown(self.shutdown_grace).await;
        self.client
            .close()
            .await
            .map_err(|e| e.during("close coordination session"))?;
        info!(session = %self.client.session_id(), "Distributed lock backend shut down");
        Ok(())
    }
}
