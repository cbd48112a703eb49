//! Object Storage Adapter
//!
//! Narrow interface over a blob store. The core only needs four calls:
//! `get`, `put`, `list` and `delete`, keyed by `/`-separated object keys.
//!
//! # Implementations
//!
//! - [`InMemoryObjectStore`]: process-local bucket, used by tests and
//!   embedded deployments
//! - [`LocalFsObjectStore`]: bucket backed by a directory tree
//! - [`RetryingObjectStore`]: wraps any store and retries transient failures
//!   with the shared [`RetryPolicy`](crate::retry::RetryPolicy)

mod local;
mod memory;
mod retrying;

pub use local::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;
pub use retrying::RetryingObjectStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Core trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Backend name for logs and metrics
    fn name(&self) -> &str;

    /// Fetch an object
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Store an object, replacing any previous content under `key`
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove an object
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Whether an object exists
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Validate an object key
///
/// Keys are relative, `/`-separated, and may not contain empty, `.` or `..`
/// segments or NUL bytes.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    if key.contains('\0') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "'{}' contains forbidden characters",
            key
        )));
    }
    if key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::InvalidKey(format!(
            "'{}' contains an empty or relative path segment",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("01H/meta.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a\\b").is_err());
    }
}
