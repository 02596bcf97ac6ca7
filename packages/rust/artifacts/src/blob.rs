//! Byte-blob backends addressed by string locators.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use feedforge_shared::{FeedforgeError, Result};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Object backend under the content store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` at `locator`, replacing any previous value.
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()>;

    /// Read the blob. A missing locator is [`FeedforgeError::NotFound`].
    async fn get(&self, locator: &str) -> Result<Vec<u8>>;

    /// Remove the blob. Removing a missing locator succeeds.
    async fn delete(&self, locator: &str) -> Result<()>;

    async fn exists(&self, locator: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Blobs as files under a root directory; the locator is the relative path.
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

    fn path_for(&self, locator: &str) -> Result<PathBuf> {
        let relative = Path::new(locator);
        let safe = !locator.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(FeedforgeError::blob(locator, "locator must be a relative path"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FeedforgeError::io(parent, e))?;
        }

        // Write-then-rename so readers never observe a partial blob.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::now_v7()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| FeedforgeError::blob(locator, e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(FeedforgeError::blob(locator, e.to_string()));
        }
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.path_for(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FeedforgeError::NotFound(format!("blob {locator}")))
            }
            Err(e) => Err(FeedforgeError::blob(locator, e.to_string())),
        }
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        let path = self.path_for(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FeedforgeError::blob(locator, e.to_string())),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let path = self.path_for(locator)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| FeedforgeError::blob(locator, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Process-local blobs, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(locator.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| FeedforgeError::NotFound(format!("blob {locator}")))
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        self.blobs.write().await.remove(locator);
        Ok(())
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(locator))
    }
}
