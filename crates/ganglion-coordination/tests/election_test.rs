//! Leader election over a shared coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ganglion_coordination::{
    DistributedLockBackend, InMemoryCoordinator, LeaderElector, LeaderListener, LeadershipToken,
    LockBackend, SingleProcessLockBackend,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    Leader(usize),
    Revoked(usize),
    NotLeader(usize),
}

struct RecordingListener {
    id: usize,
    events: mpsc::UnboundedSender<Seen>,
}

#[async_trait]
impl LeaderListener for RecordingListener {
    async fn is_leader(&self, token: LeadershipToken) {
        let _ = self.events.send(Seen::Leader(self.id));
        // stay leader until told otherwise
        token.revoked().await;
        let _ = self.events.send(Seen::Revoked(self.id));
    }

    async fn not_leader(&self) {
        let _ = self.events.send(Seen::NotLeader(self.id));
    }
}

async fn drain_for(rx: &mut mpsc::UnboundedReceiver<Seen>, window: Duration) -> Vec<Seen> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        seen.push(event);
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exactly_one_leader_and_failover_promotes_one_other() {
    let coordinator = InMemoryCoordinator::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut backends = Vec::new();
    let mut electors = Vec::new();
    for id in 0..3 {
        let backend = Arc::new(DistributedLockBackend::new(coordinator.connect()));
        let elector = LeaderElector::new(backend.clone());
        elector
            .elect(
                "indexer",
                Arc::new(RecordingListener {
                    id,
                    events: tx.clone(),
                }),
            )
            .await
            .unwrap();
        backends.push(backend);
        electors.push(elector);
    }

    let seen = drain_for(&mut rx, Duration::from_millis(200)).await;
    let leaders: Vec<usize> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Leader(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(leaders.len(), 1, "events: {:?}", seen);
    let first_leader = leaders[0];

    // kill the leader's process
    coordinator.expire_session(backends[first_leader].session_id());

    let seen = drain_for(&mut rx, Duration::from_millis(200)).await;
    assert!(seen.contains(&Seen::Revoked(first_leader)), "events: {:?}", seen);
    assert!(seen.contains(&Seen::NotLeader(first_leader)), "events: {:?}", seen);

    let promoted: Vec<usize> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Leader(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(promoted.len(), 1, "events: {:?}", seen);
    assert_ne!(promoted[0], first_leader);
    assert!(
        coordinator
            .election_leader("/ganglion/leaders/indexer")
            .is_some_and(|p| p.starts_with(backends[promoted[0]].session_id()))
    );

    for elector in &electors {
        elector.shutdown().await;
    }
}

#[tokio::test]
async fn single_process_never_reports_not_leader() {
    let backend = Arc::new(SingleProcessLockBackend::new());
    let elector = LeaderElector::new(backend.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for id in 0..3 {
        elector
            .elect(
                "indexer",
                Arc::new(RecordingListener {
                    id,
                    events: tx.clone(),
                }),
            )
            .await
            .unwrap();
    }

    let mut leaders = Vec::new();
    for _ in 0..3 {
        match rx.recv().await {
            Some(Seen::Leader(id)) => leaders.push(id),
            other => panic!("unexpected {:?}", other),
        }
    }
    leaders.sort();
    assert_eq!(leaders, vec![0, 1, 2]);

    elector.shutdown().await;
    let after = drain_for(&mut rx, Duration::from_millis(50)).await;
    assert!(after.iter().all(|s| matches!(s, Seen::Revoked(_))));
    assert_eq!(after.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elector_shutdown_hands_leadership_to_another_participant() {
    let coordinator = InMemoryCoordinator::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = Arc::new(DistributedLockBackend::new(coordinator.connect()));
    let second = Arc::new(DistributedLockBackend::new(coordinator.connect()));
    let first_elector = LeaderElector::new(first.clone());
    let second_elector = LeaderElector::new(second.clone());
    for (id, elector) in [&first_elector, &second_elector].into_iter().enumerate() {
        elector
            .elect(
                "indexer",
                Arc::new(RecordingListener {
                    id,
                    events: tx.clone(),
                }),
            )
            .await
            .unwrap();
    }

    let seen = drain_for(&mut rx, Duration::from_millis(100)).await;
    assert_eq!(seen, vec![Seen::Leader(0)]);

    // the process keeps running; only the elector goes away
    first_elector.shutdown().await;

    let seen = drain_for(&mut rx, Duration::from_millis(500)).await;
    assert!(seen.contains(&Seen::Revoked(0)), "events: {:?}", seen);
    assert!(seen.contains(&Seen::Leader(1)), "events: {:?}", seen);
    assert!(
        coordinator
            .election_leader("/ganglion/leaders/indexer")
            .is_some_and(|p| p.starts_with(second.session_id()))
    );

    second_elector.shutdown().await;
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}
