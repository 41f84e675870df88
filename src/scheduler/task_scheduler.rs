//! Queue-of-queues scheduler backed by a [`QueueStore`].
//!
//! Each queue is a store list named after its encoded key. An index set
//! lists every queue that currently holds work, and a liveness hash records
//! when each queue was last drained.
//!
//! # Store Layout
//!
//! - `{prefix}/index`: set of encoded queue keys with pending work
//! - `{prefix}/active`: hash of encoded queue key to last-activity millis
//! - `{prefix}/queue/{key}`: list of encoded tasks, front first
//! - `{prefix}/new-queue`: pub/sub channel announcing newly created queues
//!
//! # Dispatch
//!
//! Predicate dequeues first probe the existing queues. Callers that find no
//! work register a listener; the notification loop offers every newly created
//! queue to waiting listeners, so a caller waiting before a matching enqueue
//! completes receives that task without polling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{QueueId, QueueItem};
use super::listener::{Listener, ListenerSet, QueuePredicate};
use super::liveness::{decode_timestamp, encode_timestamp, ActiveQueueTracker};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{QueueStore, Subscription};

/// Maximum number of listeners examined per lock acquisition.
const LISTENER_BATCH_SIZE: usize = 10;

/// Delay before re-subscribing after the notification stream drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Configuration for a [`TaskScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Prefix for every store key owned by the scheduler.
    pub key_prefix: String,
    /// A queue without activity for longer than this is inactive.
    pub stale_after: Duration,
    /// How long the local liveness set is kept before being discarded.
    pub active_reset_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "compute/tasks".to_string(),
            stale_after: Duration::from_secs(600),
            active_reset_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with the given key prefix.
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Default::default()
        }
    }

    /// Sets the staleness window for inactive queue detection.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the local liveness set reset interval.
    pub fn with_active_reset_interval(mut self, interval: Duration) -> Self {
        self.active_reset_interval = interval;
        self
    }
}

/// Store keys derived from the configured prefix.
#[derive(Debug, Clone)]
struct SchedulerKeys {
    index: String,
    active: String,
    new_queue_channel: String,
    queue_prefix: String,
}

impl SchedulerKeys {
    fn new(prefix: &str) -> Self {
        Self {
            index: format!("{}/index", prefix),
            active: format!("{}/active", prefix),
            new_queue_channel: format!("{}/new-queue", prefix),
            queue_prefix: format!("{}/queue/", prefix),
        }
    }

    fn queue(&self, member: &str) -> String {
        format!("{}{}", self.queue_prefix, member)
    }
}

/// State shared between the scheduler handle and its notification loop.
struct SchedulerInner<Q: QueueId, T: QueueItem> {
    store: Arc<dyn QueueStore>,
    keys: SchedulerKeys,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    listeners: ListenerSet<Q, T>,
    liveness: ActiveQueueTracker,
    metrics: MetricsCollector,
}

/// Scheduler distributing tasks across dynamically created queues.
///
/// `Q` identifies a queue and `T` is the queued task. Both are stored through
/// their [`StoreCodec`](super::StoreCodec) encodings.
pub struct TaskScheduler<Q: QueueId, T: QueueItem> {
    inner: Arc<SchedulerInner<Q, T>>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<Q: QueueId, T: QueueItem> TaskScheduler<Q, T> {
    /// Creates a scheduler over `store`. Call [`TaskScheduler::start`] to
    /// enable wake-ups for blocked predicate dequeues.
    pub fn new(store: Arc<dyn QueueStore>, config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let liveness = ActiveQueueTracker::new(config.active_reset_interval, Arc::clone(&clock));

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                keys: SchedulerKeys::new(&config.key_prefix),
                config,
                clock,
                listeners: ListenerSet::default(),
                liveness,
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Subscribes to new-queue notifications and spawns the dispatch loop.
    ///
    /// Calling this on a running scheduler does nothing.
    pub async fn start(&self) -> Result<(), StoreError> {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let subscription = self
            .inner
            .store
            .subscribe(&self.inner.keys.new_queue_channel)
            .await?;
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            inner.run_notification_loop(subscription, shutdown_rx).await;
        }));

        Ok(())
    }

    /// Stops the dispatch loop and waits for it to exit.
    pub async fn shutdown(&self) {
        let Some(handle) = self.loop_handle.lock().await.take() else {
            return;
        };

        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Queue notification loop panicked");
        }
    }

    /// Adds `task` to the queue `queue`, at the front if `at_front` is set.
    ///
    /// Creates the queue if needed. After a successful return the task is
    /// stored exactly once.
    pub async fn enqueue(&self, queue: &Q, task: &T, at_front: bool) -> Result<(), StoreError> {
        self.inner.enqueue(queue, task, at_front).await
    }

    /// Pops the front task of `queue`, marking the queue active.
    pub async fn dequeue(&self, queue: &Q) -> Result<Option<T>, StoreError> {
        self.inner.dequeue(queue).await
    }

    /// Takes a task from any queue accepted by `predicate`.
    ///
    /// Existing queues are probed first. If none yields a task the call waits
    /// for a matching queue to be created, or for `cancel` to fire, in which
    /// case it returns `Ok(None)`.
    pub async fn dequeue_matching<P>(
        &self,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<Option<(Q, T)>, StoreError>
    where
        P: Fn(Q) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        let predicate: QueuePredicate<Q> = Arc::new(predicate);

        // Register before probing so that a queue created mid-probe still
        // reaches this caller through the notification loop.
        let mut registration = Registration::new(&self.inner, Arc::clone(&predicate));

        let probed = self.inner.probe(&predicate).await;
        if !matches!(probed, Ok(None)) {
            if let Some(raced) = registration.withdraw() {
                self.inner.requeue(raced).await;
            }
            return probed;
        }

        if cancel.is_cancelled() {
            if let Some(raced) = registration.withdraw() {
                self.inner.requeue(raced).await;
            }
            return Ok(None);
        }

        // Cancellation wins over an entry arriving at the same time; the
        // entry is then requeued by `withdraw`.
        let received = match registration.receiver() {
            Some(rx) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                entry = rx => entry.ok(),
            },
            None => None,
        };

        if let Some(entry) = received {
            registration.complete();
            return Ok(Some(entry));
        }

        if let Some(raced) = registration.withdraw() {
            self.inner.requeue(raced).await;
        }
        Ok(None)
    }

    /// Returns every queue whose last activity is older than the staleness
    /// window, deleting the stale liveness records it finds.
    pub async fn inactive_queues(&self) -> Result<Vec<Q>, StoreError> {
        self.inner.inactive_queues().await
    }

    /// Returns every queue that currently holds work.
    pub async fn queues(&self) -> Result<Vec<Q>, StoreError> {
        let members = self.inner.store.set_members(&self.inner.keys.index).await?;
        Ok(members
            .iter()
            .filter_map(|raw| self.inner.decode_queue(raw))
            .collect())
    }

    /// Returns the number of tasks in `queue`.
    pub async fn queue_length(&self, queue: &Q) -> Result<usize, StoreError> {
        let member = queue.encode()?;
        self.inner.store.list_len(&self.inner.keys.queue(&member)).await
    }

    /// Returns the number of callers blocked in [`TaskScheduler::dequeue_matching`].
    pub fn waiting_listeners(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl<Q: QueueId, T: QueueItem> SchedulerInner<Q, T> {
    async fn enqueue(&self, queue: &Q, task: &T, at_front: bool) -> Result<(), StoreError> {
        let member = queue.encode()?;
        let list = self.keys.queue(&member);
        let value = task.encode()?;

        loop {
            if self.store.push_if_exists(&list, &value, at_front).await? > 0 {
                break;
            }

            if self
                .store
                .create_list(&list, &value, &self.keys.index, &member)
                .await?
            {
                // A fresh queue gets a full staleness window before it can expire.
                self.store
                    .hash_set(&self.keys.active, &member, &encode_timestamp(self.clock.now()))
                    .await?;
                self.store
                    .publish(&self.keys.new_queue_channel, &member)
                    .await?;
                debug!(queue = %queue, "Created queue");
                break;
            }

            debug!(queue = %queue, "Queue appeared while creating it, retrying push");
        }

        self.metrics.record_enqueued();
        Ok(())
    }

    async fn dequeue(&self, queue: &Q) -> Result<Option<T>, StoreError> {
        let member = queue.encode()?;
        self.mark_active(&member).await?;

        let list = self.keys.queue(&member);
        let popped = self.store.pop_front(&list).await?;
        if popped.is_drained() {
            // Fails harmlessly if a concurrent enqueue re-created the list.
            self.store
                .remove_if_absent(&self.keys.index, &member, &list)
                .await?;
        }

        popped.value.map(|raw| T::decode(&raw)).transpose()
    }

    async fn mark_active(&self, member: &str) -> Result<(), StoreError> {
        if self.liveness.mark(member) {
            self.store
                .hash_set(&self.keys.active, member, &encode_timestamp(self.clock.now()))
                .await?;
        }
        Ok(())
    }

    /// Tries every indexed queue accepted by `predicate`, in index order.
    async fn probe(&self, predicate: &QueuePredicate<Q>) -> Result<Option<(Q, T)>, StoreError> {
        let members = self.store.set_members(&self.keys.index).await?;

        for raw in members {
            let Some(queue) = self.decode_queue(&raw) else {
                continue;
            };
            if !predicate(queue.clone()).await {
                continue;
            }
            if let Some(task) = self.dequeue(&queue).await? {
                return Ok(Some((queue, task)));
            }
        }

        Ok(None)
    }

    async fn inactive_queues(&self) -> Result<Vec<Q>, StoreError> {
        let indexed = self.store.set_members(&self.keys.index).await?;
        let activity = self.store.hash_get_all(&self.keys.active).await?;

        let cutoff = chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window));

        let mut active = HashSet::new();
        for (member, stamp) in activity {
            match decode_timestamp(&stamp) {
                Some(time) if cutoff.map_or(true, |cutoff| time >= cutoff) => {
                    active.insert(member);
                }
                _ => {
                    self.store.hash_delete(&self.keys.active, &member).await?;
                }
            }
        }

        Ok(indexed
            .iter()
            .filter(|member| !active.contains(*member))
            .filter_map(|member| self.decode_queue(member))
            .collect())
    }

    /// Puts an entry that no caller took back at the front of its queue.
    async fn requeue(&self, (queue, task): (Q, T)) {
        if let Err(e) = self.enqueue(&queue, &task, true).await {
            error!(queue = %queue, error = %e, "Failed to requeue undelivered task");
        }
    }

    fn decode_queue(&self, raw: &str) -> Option<Q> {
        match Q::decode(raw) {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!(member = raw, error = %e, "Skipping undecodable queue key");
                None
            }
        }
    }

    async fn run_notification_loop(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(channel = %self.keys.new_queue_channel, "Queue notification loop started");

        loop {
            let first = tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = subscription.recv() => message,
            };

            let Some(first) = first else {
                warn!("Queue notification subscription closed, resubscribing");
                match self.resubscribe(&mut shutdown_rx).await {
                    Some(resubscribed) => {
                        subscription = resubscribed;
                        continue;
                    }
                    None => break,
                }
            };

            // Drain whatever else already arrived and dispatch each queue once.
            let mut batch = vec![first];
            while let Ok(next) = subscription.try_recv() {
                if !batch.contains(&next) {
                    batch.push(next);
                }
            }

            for raw in batch {
                let Some(queue) = self.decode_queue(&raw) else {
                    continue;
                };
                if let Err(e) = self.dispatch_new_queue(&queue).await {
                    error!(queue = %queue, error = %e, "Failed to dispatch new queue");
                }
            }
        }

        info!("Queue notification loop stopped");
    }

    async fn resubscribe(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Option<Subscription> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }

            match self.store.subscribe(&self.keys.new_queue_channel).await {
                Ok(subscription) => return Some(subscription),
                Err(e) => warn!(error = %e, "Failed to resubscribe to queue notifications"),
            }
        }
    }

    /// Offers a newly created queue to the waiting listeners.
    ///
    /// Listeners are examined in registration order, in batches, each at most
    /// once. A popped task that no listener accepts goes back to the front of
    /// the queue.
    async fn dispatch_new_queue(&self, queue: &Q) -> Result<(), StoreError> {
        let mut checked = HashSet::new();
        let mut undelivered: Option<T> = None;

        loop {
            let batch = self.listeners.unchecked(&checked, LISTENER_BATCH_SIZE);
            if batch.is_empty() {
                break;
            }

            for listener in batch {
                checked.insert(listener.id());
                if !listener.is_waiting() || !listener.accepts(queue.clone()).await {
                    continue;
                }

                let task = match undelivered.take() {
                    Some(task) => task,
                    None => match self.dequeue(queue).await? {
                        Some(task) => task,
                        None => return Ok(()),
                    },
                };

                match listener.try_fulfil((queue.clone(), task)) {
                    Ok(()) => {
                        debug!(queue = %queue, listener = listener.id(), "Handed task to listener")
                    }
                    Err((_, task)) => undelivered = Some(task),
                }
            }
        }

        if let Some(task) = undelivered {
            self.enqueue(queue, &task, true).await?;
        }
        Ok(())
    }
}

/// A listener registered for the duration of one `dequeue_matching` call.
///
/// Dropping a registration that was neither completed nor withdrawn (the
/// caller's future was cancelled) withdraws it and requeues any entry that
/// was handed over in the meantime.
struct Registration<Q: QueueId, T: QueueItem> {
    inner: Arc<SchedulerInner<Q, T>>,
    listener: Arc<Listener<Q, T>>,
    rx: Option<oneshot::Receiver<(Q, T)>>,
}

impl<Q: QueueId, T: QueueItem> Registration<Q, T> {
    fn new(inner: &Arc<SchedulerInner<Q, T>>, predicate: QueuePredicate<Q>) -> Self {
        let (listener, rx) = inner.listeners.register(predicate);
        Self {
            inner: Arc::clone(inner),
            listener,
            rx: Some(rx),
        }
    }

    fn receiver(&mut self) -> Option<&mut oneshot::Receiver<(Q, T)>> {
        self.rx.as_mut()
    }

    /// Unregisters after the entry was received.
    fn complete(&mut self) {
        self.rx = None;
        self.inner.listeners.remove(self.listener.id());
    }

    /// Unregisters and closes the listener, returning an entry that was
    /// handed over before the close.
    fn withdraw(&mut self) -> Option<(Q, T)> {
        self.inner.listeners.remove(self.listener.id());
        self.listener.close();
        self.rx.take().and_then(|mut rx| rx.try_recv().ok())
    }
}

impl<Q: QueueId, T: QueueItem> Drop for Registration<Q, T> {
    fn drop(&mut self) {
        if self.rx.is_none() {
            return;
        }

        if let Some(raced) = self.withdraw() {
            let inner = Arc::clone(&self.inner);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { inner.requeue(raced).await });
                }
                Err(_) => error!(queue = %raced.0, "Dropped a handed-over task outside a runtime"),
            }
        }
    }
}
