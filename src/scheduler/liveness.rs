//! Tracking of queues that are actively being drained.
//!
//! Every dequeue marks its queue active. Writing the shared liveness hash on
//! every dequeue would amplify hot-path traffic, so each process remembers
//! which queues it already recorded in a copy-on-write set and only writes
//! through for queues missing from it. The set is discarded periodically,
//! which both refreshes the shared timestamps and bounds its growth.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Process-local record of queues whose activity was already published.
pub struct ActiveQueueTracker {
    recorded: RwLock<Arc<HashSet<String>>>,
    reset_at: Mutex<DateTime<Utc>>,
    reset_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ActiveQueueTracker {
    pub fn new(reset_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            recorded: RwLock::new(Arc::new(HashSet::new())),
            reset_at: Mutex::new(now),
            reset_interval,
            clock,
        }
    }

    /// Marks `queue` active locally.
    ///
    /// Returns `true` when the caller must write the activity through to
    /// the shared liveness hash.
    pub fn mark(&self, queue: &str) -> bool {
        self.reset_if_due();

        if self.snapshot().contains(queue) {
            return false;
        }

        let mut recorded = self.recorded.write().unwrap_or_else(PoisonError::into_inner);
        if recorded.contains(queue) {
            return false;
        }
        Arc::make_mut(&mut *recorded).insert(queue.to_string());
        true
    }

    /// Returns the current set without copying it.
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        let recorded = self.recorded.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*recorded)
    }

    fn reset_if_due(&self) {
        let now = self.clock.now();
        let mut reset_at = self.reset_at.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = (now - *reset_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.reset_interval {
            *self.recorded.write().unwrap_or_else(PoisonError::into_inner) =
                Arc::new(HashSet::new());
            *reset_at = now;
        }
    }
}

/// Encodes a liveness timestamp for the shared hash.
pub fn encode_timestamp(time: DateTime<Utc>) -> String {
    time.timestamp_millis().to_string()
}

/// Decodes a liveness timestamp written by [`encode_timestamp`].
pub fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}
