//! In-process blob store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{compute_hash, validate_hash, validate_namespace, BlobStore};
use crate::error::BlobError;

/// Blob store held in memory, keyed by namespace and hash.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, namespace_id: &str, hash: &str) -> Result<Option<Vec<u8>>, BlobError> {
        validate_namespace(namespace_id)?;
        validate_hash(hash)?;

        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs
            .get(&(namespace_id.to_string(), hash.to_string()))
            .cloned())
    }

    async fn put(&self, namespace_id: &str, data: &[u8]) -> Result<String, BlobError> {
        validate_namespace(namespace_id)?;

        let hash = compute_hash(data);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace_id.to_string(), hash.clone()), data.to_vec());
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryBlobStore::new();
        let hash = store.put("ns", b"payload").await.unwrap();

        assert_eq!(store.get("ns", &hash).await.unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.get("other", &hash).await.unwrap(), None);
        assert_eq!(store.get("ns", "deadbeef").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_identical_content_is_stored_once() {
        let store = MemoryBlobStore::new();
        let first = store.put("ns", b"same").await.unwrap();
        let second = store.put("ns", b"same").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }
}
