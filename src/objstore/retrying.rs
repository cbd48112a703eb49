//! Retry wrapper for object stores

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::ObjectStore;
use crate::error::StorageError;
use crate::retry::RetryPolicy;

/// Applies a [`RetryPolicy`] to every call of the wrapped store
///
/// Only failures for which [`StorageError::is_transient`] holds are retried.
pub struct RetryingObjectStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingObjectStore {
    /// Wrap `inner` with `policy`
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ObjectStore for RetryingObjectStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.policy
            .run("objstore.get", None, StorageError::is_transient, || {
                self.inner.get(key)
            })
            .await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.policy
            .run("objstore.put", None, StorageError::is_transient, || {
                self.inner.put(key, data.clone())
            })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.policy
            .run("objstore.list", None, StorageError::is_transient, || {
                self.inner.list(prefix)
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.policy
            .run("objstore.delete", None, StorageError::is_transient, || {
                self.inner.delete(key)
            })
            .await
    }
}
