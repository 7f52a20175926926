//! Leader election.
//!
//! Backends report leadership as [`LeadershipEvent`]s on an [`ElectionSession`].
//! [`LeaderElector`] turns a session into `is_leader` / `not_leader` callbacks
//! on a supervised dispatch task. Leadership is handed to the callback as a
//! [`LeadershipToken`] that is revoked when leadership is lost or the elector
//! shuts down; long-running leader work is expected to watch it.
//!
//! Only the distributed backend ever revokes leadership. The local backends
//! make every participant leader once and never call `not_leader`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::{Result, TaskRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::backend::LockBackend;

/// Valid while its holder is the leader.
#[derive(Debug, Clone)]
pub struct LeadershipToken {
    token: CancellationToken,
}

impl LeadershipToken {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_valid(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Completes once leadership is revoked.
    pub fn revoked(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn revoke(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug)]
pub enum LeadershipEvent {
    Acquired(LeadershipToken),
    Lost,
}

/// Participation in one named election. Dropping the session, or calling
/// [`leave`](Self::leave), withdraws the participant from the backend election.
pub struct ElectionSession {
    name: String,
    events: mpsc::UnboundedReceiver<LeadershipEvent>,
    leave: Option<DropGuard>,
}

impl ElectionSession {
    /// `leave` is cancelled when the participant withdraws.
    pub fn new(
        name: impl Into<String>,
        events: mpsc::UnboundedReceiver<LeadershipEvent>,
        leave: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            leave: Some(leave.drop_guard()),
        }
    }

    /// Withdraw from the election. Leadership held through this session is
    /// revoked and the backend may promote another participant.
    pub fn leave(&mut self) {
        if self.leave.take().is_some() {
            debug!(election = %self.name, "Leaving election");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next leadership change; `None` once the backend stopped reporting.
    pub async fn next_event(&mut self) -> Option<LeadershipEvent> {
        self.events.recv().await
    }
}

/// Callbacks for leadership changes.
#[async_trait]
pub trait LeaderListener: Send + Sync {
    /// Called when this participant becomes leader. Not interrupted; return
    /// when `token` is revoked.
    async fn is_leader(&self, token: LeadershipToken);

    /// Called when leadership is lost.
    async fn not_leader(&self);
}

/// Adapts a pair of closures to [`LeaderListener`].
pub struct FnLeaderListener<L, N> {
    on_leader: L,
    on_not_leader: N,
}

impl<L, N> FnLeaderListener<L, N>
where
    L: Fn(LeadershipToken) + Send + Sync,
    N: Fn() + Send + Sync,
{
    pub fn new(on_leader: L, on_not_leader: N) -> Self {
        Self {
            on_leader,
            on_not_leader,
        }
    }
}

#[async_trait]
impl<L, N> LeaderListener for FnLeaderListener<L, N>
where
    L: Fn(LeadershipToken) + Send + Sync,
    N: Fn() + Send + Sync,
{
    async fn is_leader(&self, token: LeadershipToken) {
        (self.on_leader)(token)
    }

    async fn not_leader(&self) {
        (self.on_not_leader)()
    }
}

pub struct LeaderElector {
    backend: Arc<dyn LockBackend>,
    tasks: TaskRegistry,
    shutdown_grace: Duration,
}

impl LeaderElector {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            tasks: TaskRegistry::new(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Join the election `name` and return. Callbacks run on a dedicated task.
    pub async fn elect(&self, name: &str, listener: Arc<dyn LeaderListener>) -> Result<()> {
        let session = self.backend.leader_election(name).await?;
        self.tasks.spawn(format!("leader:{}", name), move |token| {
            dispatch(session, listener, token)
        });
        info!(election = %name, backend = %self.backend.kind(), "Joined leader election");
        Ok(())
    }

    /// [`elect`](Self::elect) with plain closures.
    pub async fn elect_with<L, N>(&self, name: &str, on_leader: L, on_not_leader: N) -> Result<()>
    where
        L: Fn(LeadershipToken) + Send + Sync + 'static,
        N: Fn() + Send + Sync + 'static,
    {
        self.elect(name, Arc::new(FnLeaderListener::new(on_leader, on_not_leader)))
            .await
    }

    /// Raw leadership events for callers driving their own loop.
    pub async fn subscribe(&self, name: &str) -> Result<ElectionSession> {
        self.backend.leader_election(name).await
    }

    /// Revoke every token handed out, leave every election joined through
    /// [`elect`](Self::elect) and wait for the dispatch tasks.
    pub async fn shutdown(&self) {
        self.tasks.shutdown(self.shutdown_grace).await;
    }
}

async fn dispatch(
    mut session: ElectionSession,
    listener: Arc<dyn LeaderListener>,
    token: CancellationToken,
) {
    let mut current: Option<CancellationToken> = None;

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = session.next_event() => event,
        };

        match event {
            Some(LeadershipEvent::Acquired(granted)) => {
                let leadership = token.child_token();
                current = Some(leadership.clone());

                let work = listener.is_leader(LeadershipToken::new(leadership.clone()));
                // Revoke our token when the backend revokes its own, without
                // cutting the listener short.
                let link = async {
                    granted.revoked().await;
                    leadership.cancel();
                    std::future::pending::<()>().await
                };
                tokio::select! {
                    _ = work => {}
                    _ = link => {}
                }
                debug!(election = %session.name(), "Leader callback returned");
            }
            Some(LeadershipEvent::Lost) => {
                if let Some(leadership) = current.take() {
                    leadership.cancel();
                }
                listener.not_leader().await;
            }
            None => break,
        }
    }

    if let Some(leadership) = current.take() {
        leadership.cancel();
    }
    session.leave();
    debug!(election = %session.name(), "Election dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalLockBackend, NoOpLockBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_local_backend_every_participant_leads() {
        let elector = LeaderElector::new(Arc::new(LocalLockBackend::new()));
        let leaders = Arc::new(AtomicUsize::new(0));
        let followers = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            let leaders = leaders.clone();
            let followers = followers.clone();
            let done_tx = done_tx.clone();
            elector
                .elect_with(
                    "e",
                    move |_token| {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        let _ = done_tx.send(());
                    },
                    move || {
                        followers.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await
                .unwrap();
        }

        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }
        elector.shutdown().await;

        assert_eq!(leaders.load(Ordering::SeqCst), 3);
        assert_eq!(followers.load(Ordering::SeqCst), 0);
    }

    struct WaitingLeader {
        started: mpsc::UnboundedSender<()>,
        finished: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl LeaderListener for WaitingLeader {
        async fn is_leader(&self, token: LeadershipToken) {
            let _ = self.started.send(());
            token.revoked().await;
            let _ = self.finished.send(());
        }

        async fn not_leader(&self) {}
    }

    #[tokio::test]
    async fn test_shutdown_revokes_leadership() {
        let elector = LeaderElector::new(Arc::new(NoOpLockBackend::new()));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();

        elector
            .elect(
                "e",
                Arc::new(WaitingLeader {
                    started: started_tx,
                    finished: finished_tx,
                }),
            )
            .await
            .unwrap();

        started_rx.recv().await.unwrap();
        elector.shutdown().await;
        assert!(finished_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_token_revoke() {
        let token = LeadershipToken::new(CancellationToken::new());
        assert!(token.is_valid());
        token.revoke();
        assert!(!token.is_valid());
        token.revoked().await;
    }
}
