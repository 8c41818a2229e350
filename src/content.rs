//! Content-addressed storage for witness generators and contribution images.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{error::ContentError, utils::content_id};

pub const GATEWAY: &str = "https://arweave.net";

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes` and return their content identifier.
    async fn put(&self, bytes: Vec<u8>) -> Result<String, ContentError>;

    async fn cat(&self, id: &str) -> Result<Vec<u8>, ContentError>;

    /// Public URL of a stored object.
    fn url(&self, id: &str) -> String {
        format!("{GATEWAY}/{id}")
    }
}

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an object, making later `cat` calls fail.
    pub async fn evict(&self, id: &str) -> bool {
        self.objects.write().await.remove(id).is_some()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, ContentError> {
        let id = content_id(&bytes);
        self.objects.write().await.insert(id.clone(), bytes);
        Ok(id)
    }

    async fn cat(&self, id: &str) -> Result<Vec<u8>, ContentError> {
        self.objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(id.to_string()))
    }
}

/// One file per object under a directory, named by content id.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, ContentError> {
        let id = content_id(&bytes);
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(&id);
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, &bytes).await?;
        }
        debug!(id = %id, bytes = bytes.len(), "Stored content");
        Ok(id)
    }

    async fn cat(&self, id: &str) -> Result<Vec<u8>, ContentError> {
        // Ids are base64url; anything else cannot name a stored object.
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ContentError::NotFound(id.to_string()));
        }
        match tokio::fs::read(self.root.join(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_evict() {
        let store = MemoryContentStore::new();
        let id = store.put(b"wasm".to_vec()).await.unwrap();
        assert_eq!(store.cat(&id).await.unwrap(), b"wasm");
        assert_eq!(store.url(&id), format!("https://arweave.net/{id}"));
        assert!(store.evict(&id).await);
        assert!(matches!(store.cat(&id).await, Err(ContentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_store_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = LocalContentStore::new(dir.path().join("content"));
        let a = store.put(b"same".to_vec()).await.unwrap();
        let b = store.put(b"same".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.cat(&a).await.unwrap(), b"same");
        assert!(matches!(store.cat("../etc").await, Err(ContentError::NotFound(_))));
        assert!(matches!(store.cat("missing").await, Err(ContentError::NotFound(_))));
    }
}
