//! Error types for Ganglion
//!
//! `GanglionError` is the error surfaced by every façade (lock service, leader
//! elector, counter, work queue, worker consumer). Boundary crates keep their own
//! narrower error enums and convert into this one with the failing operation
//! named in the message.

use std::time::Duration;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum GanglionError {
    #[error("could not acquire lock '{name}' within {}ms", timeout.as_millis())]
    LockTimeout { name: String, timeout: Duration },

    #[error("counter '{path}' not updated after {attempts} attempts")]
    CounterUpdate { path: String, attempts: u32 },

    #[error("coordination service error during {operation}: {reason}")]
    Coordination { operation: String, reason: String },

    #[error("broker connection error: {0}")]
    BrokerConnection(String),

    #[error("could not publish to '{target}': {reason}")]
    Publish { target: String, reason: String },

    #[error("consumer transport error: {0}")]
    ConsumerTransport(String),

    #[error("could not ack delivery {tag}: {reason}")]
    AckIo { tag: u64, reason: String },

    #[error("could not fail delivery {tag}: {reason}")]
    FailIo { tag: u64, reason: String },

    #[error("broker error during {operation}: {reason}")]
    Broker { operation: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GanglionError {
    pub fn coordination(operation: impl Into<String>, reason: impl ToString) -> Self {
        GanglionError::Coordination {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn broker(operation: impl Into<String>, reason: impl ToString) -> Self {
        GanglionError::Broker {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn publish(target: impl Into<String>, reason: impl ToString) -> Self {
        GanglionError::Publish {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure came from a lock wait expiring rather than from
    /// the coordination service itself.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, GanglionError::LockTimeout { .. })
    }
}

impl From<config::ConfigError> for GanglionError {
    fn from(value: config::ConfigError) -> Self {
        GanglionError::Config(value.to_string())
    }
}

impl From<serde_json::Error> for GanglionError {
    fn from(value: serde_json::Error) -> Self {
        GanglionError::IllegalArgument(format!("invalid JSON payload: {}", value))
    }
}

pub type Result<T, E = GanglionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message() {
        let err = GanglionError::LockTimeout {
            name: "lockOne".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "could not acquire lock 'lockOne' within 30000ms"
        );
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_helper_constructors() {
        let err = GanglionError::coordination("acquire /locks/a", "connection loss");
        assert_eq!(
            err.to_string(),
            "coordination service error during acquire /locks/a: connection loss"
        );
        assert!(!err.is_lock_timeout());

        let err = GanglionError::publish("graphProperty", "channel closed");
        assert!(matches!(err, GanglionError::Publish { .. }));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: GanglionError = json_err.into();
        assert!(matches!(err, GanglionError::IllegalArgument(_)));
    }
}
