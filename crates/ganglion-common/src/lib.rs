//! Ganglion Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used by the coordination and
//! queue crates:
//! - Error types
//! - Configuration access
//! - Logging initialization
//! - Supervised background tasks

pub mod config;
pub mod error;
pub mod logging;
pub mod task;

// Re-exports for convenience
pub use config::{BrokerAddress, Configuration, LockBackendKind};
pub use error::{GanglionError, Result};
pub use task::TaskRegistry;
