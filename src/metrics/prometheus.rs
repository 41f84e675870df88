//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by farm-scheduler and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all farm-scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks enqueued, including requeues.
pub static TASKS_ENQUEUED: OnceLock<Counter> = OnceLock::new();

/// Total number of leases handed to agents.
pub static LEASES_ASSIGNED: OnceLock<Counter> = OnceLock::new();

/// Time agents spent waiting for a lease, in seconds.
pub static LEASE_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Total task statuses posted, labeled by state and outcome.
pub static STATUSES_POSTED: OnceLock<CounterVec> = OnceLock::new();

/// Number of callers blocked in a predicate dequeue.
pub static WAITING_LISTENERS: OnceLock<Gauge> = OnceLock::new();

/// Requirements cache lookups, labeled by result (hit/miss).
pub static REQUIREMENTS_CACHE: OnceLock<CounterVec> = OnceLock::new();

/// Total tasks drained from inactive queues by the sweep.
pub static TASKS_EXPIRED: OnceLock<Counter> = OnceLock::new();

/// Total messages posted to status channels.
pub static MESSAGES_POSTED: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls fail to register duplicates but leave
/// the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Scheduler metrics
    let tasks_enqueued = Counter::new("farm_tasks_enqueued_total", "Total tasks enqueued")?;

    let waiting_listeners = Gauge::new(
        "farm_waiting_listeners",
        "Number of callers blocked in a predicate dequeue",
    )?;

    // Lease metrics
    let leases_assigned = Counter::new("farm_leases_assigned_total", "Total leases assigned")?;

    let lease_wait = Histogram::with_opts(
        HistogramOpts::new(
            "farm_lease_wait_seconds",
            "Time agents spent waiting for a lease",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]),
    )?;

    // Status metrics
    let statuses_posted = CounterVec::new(
        Opts::new("farm_task_statuses_total", "Total task statuses posted"),
        &["state", "outcome"],
    )?;

    let tasks_expired = Counter::new(
        "farm_tasks_expired_total",
        "Total tasks drained from inactive queues",
    )?;

    let messages_posted = Counter::new(
        "farm_messages_posted_total",
        "Total messages posted to status channels",
    )?;

    // Cache metrics
    let requirements_cache = CounterVec::new(
        Opts::new(
            "farm_requirements_cache_total",
            "Requirements cache lookups",
        ),
        &["result"],
    )?;

    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(waiting_listeners.clone()))?;
    registry.register(Box::new(leases_assigned.clone()))?;
    registry.register(Box::new(lease_wait.clone()))?;
    registry.register(Box::new(statuses_posted.clone()))?;
    registry.register(Box::new(tasks_expired.clone()))?;
    registry.register(Box::new(messages_posted.clone()))?;
    registry.register(Box::new(requirements_cache.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = WAITING_LISTENERS.set(waiting_listeners);
    let _ = LEASES_ASSIGNED.set(leases_assigned);
    let _ = LEASE_WAIT.set(lease_wait);
    let _ = STATUSES_POSTED.set(statuses_posted);
    let _ = TASKS_EXPIRED.set(tasks_expired);
    let _ = MESSAGES_POSTED.set(messages_posted);
    let _ = REQUIREMENTS_CACHE.set(requirements_cache);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
