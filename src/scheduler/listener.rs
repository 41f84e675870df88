//! In-process waiters for predicate-based dequeues.
//!
//! A [`Listener`] is created for every blocking `dequeue_matching` call that
//! could not be satisfied immediately. The notification loop hands entries
//! from newly created queues to listeners whose predicate accepts the queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::metrics::MetricsCollector;

/// Asynchronous predicate deciding whether a caller can take work from a queue.
pub type QueuePredicate<Q> = Arc<dyn Fn(Q) -> BoxFuture<'static, bool> + Send + Sync>;

/// A caller suspended until a matching queue produces an entry.
pub struct Listener<Q, T> {
    id: u64,
    predicate: QueuePredicate<Q>,
    slot: Mutex<Option<oneshot::Sender<(Q, T)>>>,
}

impl<Q, T> Listener<Q, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Evaluates the listener's predicate against `queue`.
    pub async fn accepts(&self, queue: Q) -> bool {
        (self.predicate)(queue).await
    }

    /// Returns whether the listener can still be fulfilled.
    pub fn is_waiting(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Hands `entry` to the waiting caller.
    ///
    /// The send happens under the slot lock so that it is ordered against
    /// [`Listener::close`]: either the caller observes the entry, or the
    /// entry comes back as `Err` to be requeued.
    pub fn try_fulfil(&self, entry: (Q, T)) -> Result<(), (Q, T)> {
        let mut slot = self.lock_slot();
        match slot.take() {
            Some(tx) => tx.send(entry),
            None => Err(entry),
        }
    }

    /// Prevents any further hand-off to this listener.
    pub fn close(&self) {
        self.lock_slot().take();
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<(Q, T)>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The set of listeners registered with one scheduler.
pub struct ListenerSet<Q, T> {
    listeners: Mutex<Vec<Arc<Listener<Q, T>>>>,
    next_id: AtomicU64,
    metrics: MetricsCollector,
}

impl<Q, T> Default for ListenerSet<Q, T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics: MetricsCollector::new(),
        }
    }
}

impl<Q, T> ListenerSet<Q, T> {
    /// Registers a new listener and returns it with its completion receiver.
    pub fn register(
        &self,
        predicate: QueuePredicate<Q>,
    ) -> (Arc<Listener<Q, T>>, oneshot::Receiver<(Q, T)>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Listener {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            predicate,
            slot: Mutex::new(Some(tx)),
        });

        let mut listeners = self.lock();
        listeners.push(Arc::clone(&listener));
        self.metrics.set_waiting_listeners(listeners.len());

        (listener, rx)
    }

    /// Removes the listener with id `id`, if still registered.
    pub fn remove(&self, id: u64) {
        let mut listeners = self.lock();
        listeners.retain(|l| l.id != id);
        self.metrics.set_waiting_listeners(listeners.len());
    }

    /// Returns up to `max` registered listeners whose ids are not in `checked`,
    /// in registration order.
    pub fn unchecked(&self, checked: &HashSet<u64>, max: usize) -> Vec<Arc<Listener<Q, T>>> {
        self.lock()
            .iter()
            .filter(|l| !checked.contains(&l.id))
            .take(max)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Listener<Q, T>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
