//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users that never export metrics pay nothing.

use super::prometheus::{
    LEASES_ASSIGNED, LEASE_WAIT, MESSAGES_POSTED, REQUIREMENTS_CACHE, STATUSES_POSTED,
    TASKS_ENQUEUED, TASKS_EXPIRED, WAITING_LISTENERS,
};

/// Metrics collector for recording scheduler and service activity.
///
/// # Example
///
/// ```ignore
/// use farm_scheduler::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_enqueued();
/// collector.record_status("complete", "expired");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one task pushed onto a queue.
    pub fn record_enqueued(&self) {
        if let Some(counter) = TASKS_ENQUEUED.get() {
            counter.inc();
        }
    }

    /// Record a lease handed to an agent after waiting `wait_secs`.
    pub fn record_lease_assigned(&self, wait_secs: f64) {
        if let Some(counter) = LEASES_ASSIGNED.get() {
            counter.inc();
        }
        if let Some(histogram) = LEASE_WAIT.get() {
            histogram.observe(wait_secs);
        }

        tracing::trace!(wait_secs = wait_secs, "Recorded lease metric");
    }

    /// Record a task status transition.
    ///
    /// # Arguments
    ///
    /// * `state` - Lifecycle state (e.g., "executing", "complete")
    /// * `outcome` - Outcome label, "none" for non-terminal states
    pub fn record_status(&self, state: &str, outcome: &str) {
        if let Some(counter) = STATUSES_POSTED.get() {
            counter.with_label_values(&[state, outcome]).inc();
        }
    }

    /// Record `count` tasks drained from an inactive queue.
    pub fn record_expired(&self, count: usize) {
        if let Some(counter) = TASKS_EXPIRED.get() {
            counter.inc_by(count as f64);
        }
    }

    pub fn record_message_posted(&self) {
        if let Some(counter) = MESSAGES_POSTED.get() {
            counter.inc();
        }
    }

    /// Record a requirements cache lookup.
    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        if let Some(counter) = REQUIREMENTS_CACHE.get() {
            counter.with_label_values(&[result]).inc();
        }
    }

    /// Set the number of callers blocked in a predicate dequeue.
    pub fn set_waiting_listeners(&self, count: usize) {
        if let Some(gauge) = WAITING_LISTENERS.get() {
            gauge.set(count as f64);
        }
    }
}
