//! Coordination service client boundary.
//!
//! The distributed lock backend talks to a ZooKeeper-style coordination service
//! through [`CoordinationClient`]: session-scoped mutex nodes, leader latches and
//! versioned integer values. A client instance is one session; everything it
//! holds is released when the session closes or expires.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use ganglion_common::GanglionError;
use tokio::sync::watch;

pub use memory::{InMemoryCoordinator, InMemorySession};

/// An integer node together with the version used for compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: i64,
    pub version: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("connection loss")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("node '{0}' does not exist")]
    NoNode(String),

    #[error("'{path}' is not held by '{owner}'")]
    NotOwner { path: String, owner: String },

    #[error("{0}")]
    Other(String),
}

impl CoordinationError {
    /// Errors a caller may retry on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss)
    }

    pub fn during(self, operation: impl Into<String>) -> GanglionError {
        GanglionError::coordination(operation, self)
    }
}

impl From<CoordinationError> for GanglionError {
    fn from(value: CoordinationError) -> Self {
        GanglionError::coordination("coordination request", value)
    }
}

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Identifier of the session this client holds.
    fn session_id(&self) -> &str;

    /// Wait up to `timeout` (forever when `None`) for exclusive ownership of
    /// the mutex at `path`. Returns `false` when the wait timed out.
    async fn acquire_mutex(
        &self,
        path: &str,
        owner: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, CoordinationError>;

    async fn release_mutex(&self, path: &str, owner: &str) -> Result<(), CoordinationError>;

    /// Join the leader latch at `path`. The receiver reads `true` while this
    /// participant is the leader and closes when it leaves the latch.
    async fn join_election(
        &self,
        path: &str,
        participant: &str,
    ) -> Result<watch::Receiver<bool>, CoordinationError>;

    async fn leave_election(&self, path: &str, participant: &str)
    -> Result<(), CoordinationError>;

    /// Create the value with `initial` unless it already exists; returns the
    /// current value either way.
    async fn create_value_if_absent(
        &self,
        path: &str,
        initial: i64,
    ) -> Result<VersionedValue, CoordinationError>;

    async fn read_value(&self, path: &str) -> Result<Option<VersionedValue>, CoordinationError>;

    /// Set the value if its version is still `expected_version`. `None` means
    /// another writer got there first.
    async fn compare_and_set_value(
        &self,
        path: &str,
        expected_version: u64,
        new_value: i64,
    ) -> Result<Option<VersionedValue>, CoordinationError>;

    async fn delete_value(&self, path: &str) -> Result<(), CoordinationError>;

    /// Close the session, releasing every mutex and election it holds.
    async fn close(&self) -> Result<(), CoordinationError>;
}
