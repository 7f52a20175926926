//! Ganglion Coordination - cross-process mutual exclusion
//!
//! This crate provides:
//! - `LockService`: named locks with a per-process collapsing layer
//! - `LeaderElector`: leader / not-leader callbacks over a backend election
//! - `DistributedCounter`: compare-and-set counter with bounded retries
//! - Four interchangeable lock backends and the coordination client boundary

pub mod backend;
pub mod client;
pub mod counter;
pub mod election;
pub mod lock;

pub use backend::{
    DistributedLockBackend, LocalLockBackend, LockBackend, LockGuarantee, NoOpLockBackend,
    SingleProcessLockBackend, build_backend,
};
pub use client::{CoordinationClient, CoordinationError, InMemoryCoordinator};
pub use counter::{DistributedCounter, RetryPolicy};
pub use election::{
    ElectionSession, LeaderElector, LeaderListener, LeadershipEvent, LeadershipToken,
};
pub use lock::{DEFAULT_LOCK_TIMEOUT, LockHandle, LockService};
