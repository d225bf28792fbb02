//! In-memory backend with fault injection and call counters.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Metadata, ObjectInfo, StorageBackend, validate_key};
use crate::error::{Result, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (Vec<u8>, Metadata)>>,
    fail_list: AtomicBool,
    fail_put: AtomicBool,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `list` fail.
    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `put` fail.
    pub fn set_fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Seed an object without counting it as a `put`.
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.into(), (bytes.into(), Metadata::new()));
        }
    }

    /// Metadata stored with `key`.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<Metadata> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).map(|(_, meta)| meta.clone()))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable {
            area: "memory".into(),
            reason: "lock poisoned".into(),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                area: "memory".into(),
                reason: "injected listing failure".into(),
            }
            .into());
        }
        let objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (bytes, _))| ObjectInfo {
                key: key.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        Ok(objects.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()).into())
    }

    async fn put(&self, key: &str, bytes: &[u8], metadata: &Metadata) -> Result<()> {
        validate_key(key)?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StorageError::Persistence {
                key: key.to_string(),
                reason: "injected write failure".into(),
            }
            .into());
        }
        let mut objects = self.objects.lock().map_err(|_| Self::poisoned())?;
        objects.insert(key.to_string(), (bytes.to_vec(), metadata.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let storage = MemoryStorage::new();
        storage.insert("2025/08/01/00/a.jsonl", "x");
        storage.insert("2025/08/01/23/b.jsonl", "xy");
        storage.insert("2025/08/02/00/c.jsonl", "xyz");
        let listed = storage.list("2025/08/01/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].size, 2);
        assert_eq!(storage.list_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failures() {
        let storage = MemoryStorage::new();
        storage.set_fail_list(true);
        assert!(matches!(
            storage.list("").await.unwrap_err(),
            Error::Storage(StorageError::Unavailable { .. })
        ));
        storage.set_fail_put(true);
        assert!(matches!(
            storage.put("k", b"", &Metadata::new()).await.unwrap_err(),
            Error::Storage(StorageError::Persistence { .. })
        ));
        assert!(!storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn put_keeps_metadata() {
        let storage = MemoryStorage::new();
        let mut meta = Metadata::new();
        meta.insert("content-type".into(), "application/x-ndjson".into());
        storage.put("k.jsonl", b"{}\n", &meta).await.unwrap();
        assert_eq!(
            storage.metadata("k.jsonl").unwrap().get("content-type").unwrap(),
            "application/x-ndjson"
        );
    }
}
