//! Filesystem blob storage for large cached bodies

use crate::{BlobStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Blob store writing one file per key under a base directory.
///
/// Keys are content hashes produced by the cache engine; anything that
/// could escape the base directory is rejected.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub async fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;

        info!(path = ?base_path, "Blob storage initialized");
        Ok(Self { base_path })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let safe = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !safe || key.starts_with('.') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        fs::write(&path, &body).await?;
        debug!(key = %key, bytes = body.len(), "Blob stored");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
