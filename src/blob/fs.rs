//! Filesystem blob store.
//!
//! Blobs live at `{root}/{namespace}/{hash[..2]}/{hash}`. The two-character
//! fan-out keeps directories small. Writes go to a temporary file that is
//! renamed into place, so readers never observe a partial blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{compute_hash, validate_hash, validate_namespace, BlobStore};
use crate::error::BlobError;

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, namespace_id: &str, hash: &str) -> PathBuf {
        let subdir = &hash[0..2.min(hash.len())];
        self.root.join(namespace_id).join(subdir).join(hash)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, namespace_id: &str, hash: &str) -> Result<Option<Vec<u8>>, BlobError> {
        validate_namespace(namespace_id)?;
        validate_hash(hash)?;

        match fs::read(self.blob_path(namespace_id, hash)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn put(&self, namespace_id: &str, data: &[u8]) -> Result<String, BlobError> {
        validate_namespace(namespace_id)?;

        let hash = compute_hash(data);
        let path = self.blob_path(namespace_id, &hash);

        // Content-addressed, so an existing file already holds these bytes.
        if fs::try_exists(&path).await? {
            return Ok(hash);
        }

        let Some(parent) = path.parent() else {
            return Err(BlobError::Backend(format!(
                "blob path {:?} has no parent directory",
                path
            )));
        };
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.{}", hash, Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        tracing::debug!(namespace = namespace_id, hash = %hash, size = data.len(), "Stored blob");
        Ok(hash)
    }
}
