//! In-memory bucket

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{validate_key, ObjectStore};
use crate::error::StorageError;

/// Process-local object store backed by a sorted map
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    put_ops: AtomicU64,
    get_ops: AtomicU64,
}

impl InMemoryObjectStore {
    /// Create an empty bucket
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total number of `put` calls served
    pub fn put_count(&self) -> u64 {
        self.put_ops.load(Ordering::Relaxed)
    }

    /// Total number of `get` calls served
    pub fn get_count(&self) -> u64 {
        self.get_ops.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        validate_key(key)?;
        self.get_ops.fetch_add(1, Ordering::Relaxed);
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        validate_key(key)?;
        self.put_ops.fetch_add(1, Ordering::Relaxed);
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        match self.objects.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }
}
