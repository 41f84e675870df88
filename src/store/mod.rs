//! Backing key/value store with list, set, hash and pub/sub primitives.
//!
//! The scheduler and the status message queue never touch a backend
//! directly. Everything goes through [`QueueStore`], whose conditional
//! operations are atomic in every implementation:
//!
//! - [`RedisQueueStore`]: production backend. Conditional operations run as
//!   Lua scripts, multi-step updates as `MULTI`/`EXEC` pipelines.
//! - [`MemoryQueueStore`]: single-process backend with the same semantics,
//!   used by tests and embedded deployments.
//!
//! Lists follow Redis semantics: a list that becomes empty ceases to exist,
//! which is what the "exists / absent" conditions observe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;

/// Receiving end of a pub/sub subscription. Yields message payloads.
pub type Subscription = mpsc::UnboundedReceiver<String>;

/// Result of popping the front of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPop {
    /// The popped element, if the list held one.
    pub value: Option<String>,
    /// Number of elements left after the pop.
    pub remaining: usize,
}

impl ListPop {
    /// Returns whether the list no longer exists after this pop.
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

/// Atomic primitives required from a backing store.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Pushes `value` onto `list` only if the list already exists.
    ///
    /// Returns the new length, or `0` when the list does not exist and
    /// nothing was pushed.
    async fn push_if_exists(
        &self,
        list: &str,
        value: &str,
        at_front: bool,
    ) -> Result<usize, StoreError>;

    /// Creates `list` holding `value` and adds `member` to the set `index`,
    /// as one operation conditional on `list` being absent.
    ///
    /// Returns `false` without changing anything if the list exists.
    async fn create_list(
        &self,
        list: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, StoreError>;

    /// Pops the front element of `list`.
    async fn pop_front(&self, list: &str) -> Result<ListPop, StoreError>;

    /// Removes `member` from the set `index`, conditional on `list` being
    /// absent. Returns whether the condition held.
    async fn remove_if_absent(
        &self,
        index: &str,
        member: &str,
        list: &str,
    ) -> Result<bool, StoreError>;

    /// Returns the length of `list` (`0` if absent).
    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;

    /// Returns every member of the set `set`.
    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Sets `field` of the hash `hash` to `value`.
    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Returns every field/value pair of the hash `hash`.
    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Deletes `field` from the hash `hash`.
    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError>;

    /// Appends `value` to `list` and resets the list's time-to-live, as one
    /// operation. Returns the new length.
    async fn append_with_ttl(
        &self,
        list: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Removes and returns every element of `list`, as one operation.
    async fn take_all(&self, list: &str) -> Result<Vec<String>, StoreError>;

    /// Publishes `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribes to `channel`. The subscription is active when this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}
