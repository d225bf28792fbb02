//! Storage boundary: a key/value object store with prefix listing.
//!
//! Each configured area (primary data, backups, the complement output) is a
//! [`StorageArea`]: a name, a key prefix, a role and a backend. Backends only
//! see relative object keys such as `2025/08/01/00/2025-08-01_00-40.jsonl`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AreaConfig, AreaRole};
use crate::error::{Result, StorageError};

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

/// Free-form object metadata (content type, provenance).
pub type Metadata = BTreeMap<String, String>;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Object storage operations consumed by the pipeline.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Every object whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: &[u8], metadata: &Metadata) -> Result<()>;
}

/// A named storage area.
#[derive(Debug, Clone)]
pub struct StorageArea {
    pub name: String,
    pub prefix: String,
    pub role: AreaRole,
    pub backend: Arc<dyn StorageBackend>,
}

impl StorageArea {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        role: AreaRole,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            role,
            backend,
        }
    }

    /// Filesystem-backed area from its config entry.
    #[must_use]
    pub fn from_config(config: &AreaConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.prefix.clone(),
            config.role,
            Arc::new(FsStorage::new(config.root.clone())),
        )
    }

    #[must_use]
    pub fn is_output(&self) -> bool {
        self.role == AreaRole::Output
    }

    /// Wrap a backend failure as this area being unavailable.
    pub(crate) fn unavailable(&self, reason: impl std::fmt::Display) -> StorageError {
        StorageError::Unavailable {
            area: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Reject keys that could escape a backend root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part == ".." || part == ".");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()).into());
    }
    Ok(())
}
