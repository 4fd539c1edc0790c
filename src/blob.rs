//! Raw document bytes, addressed by key.
//!
//! A document's `content_ref` is the key its original file was stored
//! under. [`FsBlobStore`] maps keys to paths below a root directory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result, Service, ServiceResultExt};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fails with `NotFound` for an unknown key.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `key` below the root. Absolute keys and `..` are rejected.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(Error::Validation(format!("invalid blob key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .service_err(Service::BlobStore)?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .service_err(Service::BlobStore)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("blob", key))
            }
            Err(e) => Err(Error::external(Service::BlobStore, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::external(Service::BlobStore, e)),
        }
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> Error {
    Error::external(Service::BlobStore, format!("lock poisoned: {}", err))
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .map_err(poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("blob", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_put_fetch_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("2024/doc.txt", b"hello").await.unwrap();
        assert_eq!(store.fetch("2024/doc.txt").await.unwrap(), b"hello");

        store.delete("2024/doc.txt").await.unwrap();
        assert!(store.fetch("2024/doc.txt").await.unwrap_err().is_not_found());
        // Second delete is a no-op.
        store.delete("2024/doc.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        for key in ["../etc/passwd", "/abs/path", ""] {
            assert!(matches!(
                store.put(key, b"x").await,
                Err(Error::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = InMemoryBlobStore::new();
        store.put("k", b"v").await.unwrap();
        assert!(store.contains("k"));
        store.delete("k").await.unwrap();
        assert!(store.fetch("k").await.unwrap_err().is_not_found());
    }
}
