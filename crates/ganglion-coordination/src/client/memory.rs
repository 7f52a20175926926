//! In-process coordination service.
//!
//! Every [`InMemoryCoordinator::connect`] opens a new session, so several lock
//! backends sharing one coordinator behave like independent processes talking
//! to the same ensemble.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::debug;

use super::{CoordinationClient, CoordinationError, VersionedValue};

struct MutexHolder {
    session: String,
    owner: String,
}

struct Participant {
    session: String,
    id: String,
    tx: watch::Sender<bool>,
}

#[derive(Default)]
struct CoordinatorState {
    sessions: HashSet<String>,
    mutexes: HashMap<String, MutexHolder>,
    notifiers: HashMap<String, Arc<Notify>>,
    elections: HashMap<String, Vec<Participant>>,
    values: HashMap<String, VersionedValue>,
}

impl CoordinatorState {
    fn notifier(&mut self, path: &str) -> Arc<Notify> {
        self.notifiers
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn remove_participants<P>(&mut self, path: &str, mut predicate: P)
    where
        P: FnMut(&Participant) -> bool,
    {
        let Some(participants) = self.elections.get_mut(path) else {
            return;
        };

        let leader_left = participants.first().is_some_and(&mut predicate);
        let (leaving, staying): (Vec<_>, Vec<_>) =
            participants.drain(..).partition(|p| predicate(p));
        *participants = staying;

        for p in leaving {
            p.tx.send_replace(false);
        }

        if leader_left && let Some(next) = participants.first() {
            debug!(path = %path, participant = %next.id, "Leadership passed on");
            next.tx.send_replace(true);
        }

        if participants.is_empty() {
            self.elections.remove(path);
        }
    }
}

struct CoordinatorInner {
    state: Mutex<CoordinatorState>,
    next_session: AtomicU64,
    injected_failures: AtomicU32,
}

impl CoordinatorInner {
    fn check(&self, session: &str) -> Result<(), CoordinationError> {
        if !self.state.lock().sessions.contains(session) {
            return Err(CoordinationError::SessionExpired);
        }

        let failed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(())
    }

    fn end_session(&self, session: &str) {
        let mut state = self.state.lock();
        if !state.sessions.remove(session) {
            return;
        }

        let held: Vec<String> = state
            .mutexes
            .iter()
            .filter(|(_, holder)| holder.session == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in held {
            state.mutexes.remove(&path);
            state.notifier(&path).notify_waiters();
        }

        let elections: Vec<String> = state.elections.keys().cloned().collect();
        for path in elections {
            state.remove_participants(&path, |p| p.session == session);
        }

        debug!(session = %session, "Coordination session ended");
    }
}

#[derive(Clone)]
pub struct InMemoryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(CoordinatorState::default()),
                next_session: AtomicU64::new(1),
                injected_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Open a new session.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let id = format!(
            "session-{}",
            self.inner.next_session.fetch_add(1, Ordering::Relaxed)
        );
        self.inner.state.lock().sessions.insert(id.clone());
        debug!(session = %id, "Coordination session opened");

        Arc::new(InMemorySession {
            id,
            inner: self.inner.clone(),
        })
    }

    /// Drop a session as if its process died.
    pub fn expire_session(&self, session_id: &str) {
        self.inner.end_session(session_id);
    }

    /// Make the next `n` requests (from any session) fail with connection loss.
    pub fn fail_next_operations(&self, n: u32) {
        self.inner.injected_failures.store(n, Ordering::SeqCst);
    }

    pub fn mutex_owner(&self, path: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .mutexes
            .get(path)
            .map(|h| h.owner.clone())
    }

    pub fn election_leader(&self, path: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .elections
            .get(path)
            .and_then(|p| p.first())
            .map(|p| p.id.clone())
    }

    pub fn value(&self, path: &str) -> Option<VersionedValue> {
        self.inner.state.lock().values.get(path).copied()
    }
}

pub struct InMemorySession {
    id: String,
    inner: Arc<CoordinatorInner>,
}

impl InMemorySession {
    fn try_take_mutex(&self, path: &str, owner: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.mutexes.get(path) {
            None => {
                state.mutexes.insert(
                    path.to_string(),
                    MutexHolder {
                        session: self.id.clone(),
                        owner: owner.to_string(),
                    },
                );
                true
            }
            Some(holder) => holder.session == self.id && holder.owner == owner,
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn acquire_mutex(
        &self,
        path: &str,
        owner: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, CoordinationError> {
        self.inner.check(&self.id)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notify = self.inner.state.lock().notifier(path);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before looking at the holder so a release in between
            // still wakes us.
            notified.as_mut().enable();

            if self.try_take_mutex(path, owner) {
                debug!(path = %path, owner = %owner, "Mutex acquired");
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
                None => notified.await,
            }

            // The session may have ended while we waited.
            if !self.inner.state.lock().sessions.contains(&self.id) {
                return Err(CoordinationError::SessionExpired);
            }
        }
    }

    async fn release_mutex(&self, path: &str, owner: &str) -> Result<(), CoordinationError> {
        self.inner.check(&self.id)?;
        let mut state = self.inner.state.lock();

        let held = state
            .mutexes
            .get(path)
            .is_some_and(|h| h.session == self.id && h.owner == owner);
        if !held {
            return Err(CoordinationError::NotOwner {
                path: path.to_string(),
                owner: owner.to_string(),
            });
        }

        state.mutexes.remove(path);
        state.notifier(path).notify_waiters();
        debug!(path = %path, owner = %owner, "Mutex released");
        Ok(())
    }

    async fn join_election(
        &self,
        path: &str,
        participant: &str,
    ) -> Result<watch::Receiver<bool>, CoordinationError> {
        self.inner.check(&self.id)?;
        let mut state = self.inner.state.lock();

        let participants = state.elections.entry(path.to_string()).or_default();
        let (tx, rx) = watch::channel(participants.is_empty());
        participants.push(Participant {
            session: self.id.clone(),
            id: participant.to_string(),
            tx,
        });

        debug!(path = %path, participant = %participant, "Joined election");
        Ok(rx)
    }

    async fn leave_election(
        &self,
        path: &str,
        participant: &str,
    ) -> Result<(), CoordinationError> {
        self.inner.check(&self.id)?;
        self.inner
            .state
            .lock()
            .remove_participants(path, |p| p.session == self.id && p.id == participant);
        debug!(path = %path, participant = %participant, "Left election");
        Ok(())
    }

    async fn create_value_if_absent(
        &self,
        path: &str,
        initial: i64,
    ) -> Result<VersionedValue, CoordinationError> {
        self.inner.check(&self.id)?;
        let mut state = self.inner.state.lock();
        let value = *state.values.entry(path.to_string()).or_insert(VersionedValue {
            value: initial,
            version: 0,
        });
        Ok(value)
    }

    async fn read_value(&self, path: &str) -> Result<Option<VersionedValue>, CoordinationError> {
        self.inner.check(&self.id)?;
        Ok(self.inner.state.lock().values.get(path).copied())
    }

    async fn compare_and_set_value(
        &self,
        path: &str,
        expected_version: u64,
        new_value: i64,
    ) -> Result<Option<VersionedValue>, CoordinationError> {
        self.inner.check(&self.id)?;
        let mut state = self.inner.state.lock();

        let Some(current) = state.values.get_mut(path) else {
            return Err(CoordinationError::NoNode(path.to_string()));
        };
        if current.version != expected_version {
            return Ok(None);
        }

        current.value = new_value;
        current.version += 1;
        Ok(Some(*current))
    }

    async fn delete_value(&self, path: &str) -> Result<(), CoordinationError> {
        self.inner.check(&self.id)?;
        self.inner.state.lock().values.remove(path);
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.inner.end_session(&self.id);
        Ok(())
    }
}
