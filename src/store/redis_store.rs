//! Redis-backed queue store.
//!
//! Plain commands go through a shared [`ConnectionManager`], which
//! reconnects automatically. Each subscription opens a dedicated pub/sub
//! connection whose messages are forwarded to an unbounded channel by a
//! spawned task.
//!
//! Conditional operations ("only if the list exists / is absent") are Lua
//! scripts so the check and the mutation execute atomically on the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ListPop, QueueStore, Subscription};
use crate::error::StoreError;

const CREATE_LIST_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

const POP_FRONT_SCRIPT: &str = r#"
local value = redis.call('LPOP', KEYS[1])
local remaining = redis.call('LLEN', KEYS[1])
return {value, remaining}
"#;

const REMOVE_IF_ABSENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SREM', KEYS[2], ARGV[1])
return 1
"#;

/// Queue store backed by a Redis server.
#[derive(Clone)]
pub struct RedisQueueStore {
    client: redis::Client,
    redis: ConnectionManager,
    create_list: Script,
    pop_front: Script,
    remove_if_absent: Script,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("redis", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("Connected queue store to Redis");

        Ok(Self {
            client,
            redis,
            create_list: Script::new(CREATE_LIST_SCRIPT),
            pop_front: Script::new(POP_FRONT_SCRIPT),
            remove_if_absent: Script::new(REMOVE_IF_ABSENT_SCRIPT),
        })
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push_if_exists(
        &self,
        list: &str,
        value: &str,
        at_front: bool,
    ) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let command = if at_front { "LPUSHX" } else { "RPUSHX" };
        let len: usize = redis::cmd(command)
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn create_list(
        &self,
        list: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let applied: i64 = self
            .create_list
            .key(list)
            .key(index)
            .arg(value)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn pop_front(&self, list: &str) -> Result<ListPop, StoreError> {
        let mut conn = self.redis.clone();
        let (value, remaining): (Option<String>, usize) = self
            .pop_front
            .key(list)
            .invoke_async(&mut conn)
            .await?;
        Ok(ListPop { value, remaining })
    }

    async fn remove_if_absent(
        &self,
        index: &str,
        member: &str,
        list: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let applied: i64 = self
            .remove_if_absent
            .key(list)
            .key(index)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(set)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("HSET")
            .arg(hash)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(hash)
            .query_async(&mut conn)
            .await?;
        Ok(entries.into_iter().collect())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("HDEL")
            .arg(hash)
            .arg(field)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn append_with_ttl(
        &self,
        list: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(list)
            .arg(value)
            .cmd("PEXPIRE")
            .arg(list)
            .arg(ttl_ms)
            .ignore();
        let (len,): (usize,) = pipe.query_async(&mut conn).await?;
        Ok(len)
    }

    async fn take_all(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(list)
            .ignore();
        let (values,): (Vec<String>,) = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();

        // Forward messages until the connection drops or the receiver goes away.
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };

                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!(channel = %channel_name, "Redis subscription ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_key(name: &str) -> String {
        format!("farm-test/{}/{}", uuid::Uuid::new_v4(), name)
    }

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=redis://... cargo test -- --ignored
    async fn test_create_list_is_conditional() {
        let store = RedisQueueStore::connect(&redis_url())
            .await
            .expect("redis should be reachable");
        let list = unique_key("list");
        let index = unique_key("index");

        assert!(store.create_list(&list, "a", &index, "q").await.unwrap());
        assert!(!store.create_list(&list, "b", &index, "q").await.unwrap());
        assert_eq!(store.list_len(&list).await.unwrap(), 1);
        assert_eq!(store.set_members(&index).await.unwrap(), vec!["q".to_string()]);

        let popped = store.pop_front(&list).await.unwrap();
        assert_eq!(popped.value.as_deref(), Some("a"));
        assert!(popped.is_drained());
        assert!(store.remove_if_absent(&index, "q", &list).await.unwrap());
        assert!(store.set_members(&index).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_take_all_empties_list() {
        let store = RedisQueueStore::connect(&redis_url())
            .await
            .expect("redis should be reachable");
        let list = unique_key("messages");

        store
            .append_with_ttl(&list, "one", Duration::from_secs(5))
            .await
            .unwrap();
        store
            .append_with_ttl(&list, "two", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(store.take_all(&list).await.unwrap(), vec!["one", "two"]);
        assert!(store.take_all(&list).await.unwrap().is_empty());
    }
}
