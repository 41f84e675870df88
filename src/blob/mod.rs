//! Content-addressed blob storage.
//!
//! Requirements objects, task descriptions and results are stored by the
//! SHA-256 of their content, grouped into namespaces. The scheduler only
//! reads requirements through this interface; everything else is the
//! executor's concern.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::BlobError;

pub mod fs;
pub mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Get/put-by-hash access to a blob store.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Reads the blob `hash` from `namespace_id`. Returns `Ok(None)` if it
    /// does not exist.
    async fn get(&self, namespace_id: &str, hash: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Stores `data` in `namespace_id` and returns its hash.
    async fn put(&self, namespace_id: &str, data: &[u8]) -> Result<String, BlobError>;
}

/// Computes the hash a blob is stored under.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checks that `hash` is a lowercase hex digest.
pub fn validate_hash(hash: &str) -> Result<(), BlobError> {
    if hash.is_empty()
        || !hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(BlobError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

/// Checks that `namespace_id` is safe to use as a path component.
pub fn validate_namespace(namespace_id: &str) -> Result<(), BlobError> {
    let valid = !namespace_id.is_empty()
        && !namespace_id.starts_with('.')
        && namespace_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(BlobError::InvalidNamespace(namespace_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_is_sha256_hex() {
        assert_eq!(
            compute_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_validate_hash() {
        assert!(validate_hash("deadbeef").is_ok());
        assert!(validate_hash("DEADBEEF").is_err());
        assert!(validate_hash("../etc").is_err());
        assert!(validate_hash("").is_err());
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("horde.compute").is_ok());
        assert!(validate_namespace("..").is_err());
        assert!(validate_namespace("a/b").is_err());
    }
}
