//! Per-channel message lists with long-poll wake-ups.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::scheduler::StoreCodec;
use crate::store::{QueueStore, Subscription};

/// Delay before re-subscribing after the wake stream drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Configuration for a [`MessageQueue`].
#[derive(Debug, Clone)]
pub struct MessageQueueConfig {
    /// Prefix for every store key owned by the queue.
    pub key_prefix: String,
    /// Lifetime of a channel list after its most recent post.
    pub message_ttl: Duration,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "compute/messages".to_string(),
            message_ttl: Duration::from_secs(30),
        }
    }
}

impl MessageQueueConfig {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }
}

/// Local readers blocked on a channel, shared by every waiter on it.
struct ChannelWaiters {
    notify: Arc<Notify>,
    count: usize,
}

struct MessageQueueInner {
    store: Arc<dyn QueueStore>,
    config: MessageQueueConfig,
    wake_channel: String,
    waiters: Mutex<HashMap<String, ChannelWaiters>>,
    metrics: MetricsCollector,
}

/// Queue of messages per channel, consumed destructively by readers.
///
/// A channel list lives for the configured TTL after its latest post, so an
/// abandoned channel is reclaimed by the store. Each message reaches exactly
/// one reader.
pub struct MessageQueue<T> {
    inner: Arc<MessageQueueInner>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    _message: PhantomData<fn() -> T>,
}

impl<T: StoreCodec> MessageQueue<T> {
    pub fn new(store: Arc<dyn QueueStore>, config: MessageQueueConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let wake_channel = format!("{}/wake", config.key_prefix);

        Self {
            inner: Arc::new(MessageQueueInner {
                store,
                config,
                wake_channel,
                waiters: Mutex::new(HashMap::new()),
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
            loop_handle: tokio::sync::Mutex::new(None),
            _message: PhantomData,
        }
    }

    /// Subscribes to wake notifications and spawns the loop that releases
    /// local readers. Calling this on a running queue does nothing.
    pub async fn start(&self) -> Result<(), StoreError> {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let subscription = self.inner.store.subscribe(&self.inner.wake_channel).await?;
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            inner.run_wake_loop(subscription, shutdown_rx).await;
        }));

        Ok(())
    }

    /// Stops the wake loop and waits for it to exit.
    pub async fn shutdown(&self) {
        let Some(handle) = self.loop_handle.lock().await.take() else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Message wake loop panicked");
        }
    }

    /// Appends `message` to `channel_id` and refreshes the channel's TTL.
    ///
    /// The first message in an empty channel publishes a wake notification.
    pub async fn post(&self, channel_id: &str, message: &T) -> Result<(), StoreError> {
        let value = message.encode()?;
        let list = self.inner.channel_key(channel_id);

        let len = self
            .inner
            .store
            .append_with_ttl(&list, &value, self.inner.config.message_ttl)
            .await?;
        if len == 1 {
            self.inner
                .store
                .publish(&self.inner.wake_channel, channel_id)
                .await?;
        }

        self.inner.metrics.record_message_posted();
        debug!(channel = channel_id, pending = len, "Posted message");
        Ok(())
    }

    /// Takes every message currently queued on `channel_id`.
    pub async fn read_messages(&self, channel_id: &str) -> Result<Vec<T>, StoreError> {
        let raw = self
            .inner
            .store
            .take_all(&self.inner.channel_key(channel_id))
            .await?;
        raw.iter().map(|value| T::decode(value)).collect()
    }

    /// Waits until `channel_id` holds messages and takes them.
    ///
    /// Returns an empty list when `cancel` fires first.
    pub async fn wait_for_messages(
        &self,
        channel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, StoreError> {
        let waiter = WaiterGuard::register(&self.inner, channel_id);

        loop {
            let notified = waiter.notify.notified();
            tokio::pin!(notified);
            // Enabled before the re-check so a wake between the read and the
            // await is not lost.
            notified.as_mut().enable();

            let messages = self.read_messages(channel_id).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }

    /// Like [`MessageQueue::wait_for_messages`], giving up after `wait`.
    pub async fn wait_for_messages_for(
        &self,
        channel_id: &str,
        wait: Duration,
    ) -> Result<Vec<T>, StoreError> {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                cancel.cancel();
            })
        };

        let result = self.wait_for_messages(channel_id, &cancel).await;
        timer.abort();
        result
    }
}

impl MessageQueueInner {
    fn channel_key(&self, channel_id: &str) -> String {
        format!("{}/channel/{}", self.config.key_prefix, channel_id)
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<String, ChannelWaiters>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self, channel_id: &str) {
        if let Some(waiters) = self.lock_waiters().get(channel_id) {
            waiters.notify.notify_waiters();
        }
    }

    async fn run_wake_loop(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(channel = %self.wake_channel, "Message wake loop started");

        loop {
            let message = tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = subscription.recv() => message,
            };

            match message {
                Some(channel_id) => self.wake(&channel_id),
                None => {
                    warn!("Message wake subscription closed, resubscribing");
                    // Readers may have missed a wake while unsubscribed.
                    self.wake_all();
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                    match self.store.subscribe(&self.wake_channel).await {
                        Ok(resubscribed) => subscription = resubscribed,
                        Err(e) => warn!(error = %e, "Failed to resubscribe to message wakes"),
                    }
                }
            }
        }

        info!("Message wake loop stopped");
    }

    fn wake_all(&self) {
        for waiters in self.lock_waiters().values() {
            waiters.notify.notify_waiters();
        }
    }
}

/// Registration of one blocked reader; unregisters on drop.
struct WaiterGuard {
    inner: Arc<MessageQueueInner>,
    channel_id: String,
    notify: Arc<Notify>,
}

impl WaiterGuard {
    fn register(inner: &Arc<MessageQueueInner>, channel_id: &str) -> Self {
        let mut waiters = inner.lock_waiters();
        let entry = waiters
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelWaiters {
                notify: Arc::new(Notify::new()),
                count: 0,
            });
        entry.count += 1;
        let notify = Arc::clone(&entry.notify);
        drop(waiters);

        Self {
            inner: Arc::clone(inner),
            channel_id: channel_id.to_string(),
            notify,
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.inner.lock_waiters();
        if let Some(entry) = waiters.get_mut(&self.channel_id) {
            entry.count -= 1;
            if entry.count == 0 {
                waiters.remove(&self.channel_id);
            }
        }
    }
}
