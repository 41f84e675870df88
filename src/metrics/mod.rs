//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue traffic, lease assignment, status transitions and the
//! requirements cache.
//!
//! # Example
//!
//! ```ignore
//! use farm_scheduler::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_lease_assigned(0.25);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    LEASES_ASSIGNED, LEASE_WAIT, MESSAGES_POSTED, REGISTRY, REQUIREMENTS_CACHE, STATUSES_POSTED,
    TASKS_ENQUEUED, TASKS_EXPIRED, WAITING_LISTENERS,
};
