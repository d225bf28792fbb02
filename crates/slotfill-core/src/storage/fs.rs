//! Local filesystem backend. Object keys map to paths under `root`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Metadata, ObjectInfo, StorageBackend, validate_key};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> StorageError {
        StorageError::Unavailable {
            area: self.root.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // Walk from the deepest directory the prefix names.
        let dir_part = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut objects = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.unavailable(format!("{}: {e}", dir.display())).into()),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| self.unavailable(e))?
            {
                let file_type = entry.file_type().await.map_err(|e| self.unavailable(e))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                let size = entry.metadata().await.map_err(|e| self.unavailable(e))?.len();
                objects.push(ObjectInfo { key, size });
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8], _metadata: &Metadata) -> Result<()> {
        let path = self.path_for(key)?;
        let persist_err = |e: std::io::Error| StorageError::Persistence {
            key: key.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        // Write-then-rename so readers never observe a torn artifact.
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, bytes).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(persist_err)?;
        tracing::trace!(key, bytes = bytes.len(), "Stored object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn put_get_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let key = "2025/08/01/00/2025-08-01_00-40.jsonl";
        storage.put(key, b"{}\n", &Metadata::new()).await.unwrap();
        storage
            .put("2025/08/02/00/2025-08-02_00-00.jsonl", b"{}\n{}\n", &Metadata::new())
            .await
            .unwrap();

        assert!(storage.exists(key).await.unwrap());
        assert_eq!(storage.get(key).await.unwrap(), b"{}\n");

        let listed = storage.list("2025/08/01/").await.unwrap();
        assert_eq!(listed, vec![ObjectInfo { key: key.into(), size: 3 }]);
        assert_eq!(storage.list("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_day_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("never-created"));
        assert!(storage.list("2025/08/01/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let err = storage.get("2025/08/01/00/x.jsonl").await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn put_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage
            .put("a/b.jsonl", b"one\n", &Metadata::new())
            .await
            .unwrap();
        storage
            .put("a/b.jsonl", b"two\n", &Metadata::new())
            .await
            .unwrap();
        let keys: Vec<String> = storage
            .list("a/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a/b.jsonl"]);
        assert_eq!(storage.get("a/b.jsonl").await.unwrap(), b"two\n");
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let err = storage
            .put("../escape.jsonl", b"", &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::InvalidKey(_))));
    }
}
