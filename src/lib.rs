//! farm_scheduler: distributed compute task scheduling.
//!
//! This library provides a queue-of-queues task scheduler over a shared
//! key/value store, a short-lived per-channel status message queue, and the
//! compute service that assigns tasks to agents as leases.

// Core modules
pub mod blob;
pub mod cli;
pub mod clock;
pub mod compute;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used error types
pub use error::{BlobError, ComputeError, ConditionError, ConfigError, StoreError};
