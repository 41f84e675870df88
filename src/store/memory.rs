//! In-process queue store.
//!
//! Every operation takes one mutex over the whole state, which makes each of
//! them atomic with respect to the others, matching the guarantees the Redis
//! backend gets from scripts and `MULTI`/`EXEC`. List expiry is evaluated
//! lazily against the injected [`Clock`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{ListPop, QueueStore, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    expiry: HashMap<String, DateTime<Utc>>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl MemoryState {
    /// Drops `list` if its time-to-live has passed.
    fn purge_expired(&mut self, list: &str, now: DateTime<Utc>) {
        if let Some(expires_at) = self.expiry.get(list) {
            if *expires_at <= now {
                self.expiry.remove(list);
                self.lists.remove(list);
            }
        }
    }

    fn list_exists(&mut self, list: &str, now: DateTime<Utc>) -> bool {
        self.purge_expired(list, now);
        self.lists.get(list).is_some_and(|l| !l.is_empty())
    }

    /// Removes `list` and its expiry once it holds no elements.
    fn drop_if_empty(&mut self, list: &str) {
        if self.lists.get(list).is_some_and(|l| l.is_empty()) {
            self.lists.remove(list);
            self.expiry.remove(list);
        }
    }
}

/// Queue store held entirely in process memory.
#[derive(Clone)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueueStore")
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueStore {
    /// Creates an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push_if_exists(
        &self,
        list: &str,
        value: &str,
        at_front: bool,
    ) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        if !state.list_exists(list, now) {
            return Ok(0);
        }

        let Some(items) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        if at_front {
            items.push_front(value.to_string());
        } else {
            items.push_back(value.to_string());
        }
        Ok(items.len())
    }

    async fn create_list(
        &self,
        list: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.list_exists(list, now) {
            return Ok(false);
        }

        state
            .lists
            .insert(list.to_string(), VecDeque::from([value.to_string()]));
        state
            .sets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(true)
    }

    async fn pop_front(&self, list: &str) -> Result<ListPop, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired(list, now);

        let Some(items) = state.lists.get_mut(list) else {
            return Ok(ListPop {
                value: None,
                remaining: 0,
            });
        };
        let value = items.pop_front();
        let remaining = items.len();
        state.drop_if_empty(list);

        Ok(ListPop { value, remaining })
    }

    async fn remove_if_absent(
        &self,
        index: &str,
        member: &str,
        list: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.list_exists(list, now) {
            return Ok(false);
        }

        if let Some(members) = state.sets.get_mut(index) {
            members.remove(member);
            if members.is_empty() {
                state.sets.remove(index);
            }
        }
        Ok(true)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired(list, now);
        Ok(state.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        let state = self.lock();
        Ok(state
            .hashes
            .get(hash)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(fields) = state.hashes.get_mut(hash) {
            fields.remove(field);
            if fields.is_empty() {
                state.hashes.remove(hash);
            }
        }
        Ok(())
    }

    async fn append_with_ttl(
        &self,
        list: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Encode(format!("ttl out of range: {}", e)))?;

        let mut state = self.lock();
        state.purge_expired(list, now);

        let items = state.lists.entry(list.to_string()).or_default();
        items.push_back(value.to_string());
        let len = items.len();
        state.expiry.insert(list.to_string(), now + ttl);
        Ok(len)
    }

    async fn take_all(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired(list, now);
        state.expiry.remove(list);
        Ok(state
            .lists
            .remove(list)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(senders) = state.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
