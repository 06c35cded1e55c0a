//! Raw document byte storage.
//!
//! Uploaded files are kept outside SQLite, addressed by their SHA-256
//! content hash so identical uploads share one blob. The trait seam lets
//! tests swap in an in-memory implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed store; one file per content hash under the blob dir.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create blob dir: {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob: {}", path.display()))
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob: {}", path.display()))
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = match self.blobs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = match self.blobs.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No blob stored under key {}", key))
    }
}
