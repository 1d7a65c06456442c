//! In-memory fakes for storage traits
//!
//! `MemoryObjectStore` satisfies the `ObjectStore` contract without touching
//! the filesystem. It is also what an ephemeral workspace uses.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory object store backed by a `BTreeMap<path, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// All stored paths in lexical order.
    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        validate_path(path)?;
        self.objects.lock().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        validate_path(path)?;
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        validate_path(path)?;
        self.objects.lock().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        validate_path(path)?;
        Ok(self.objects.lock().contains_key(path))
    }
}
