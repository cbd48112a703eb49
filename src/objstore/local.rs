//! Filesystem-backed bucket
//!
//! Each object key maps to a file below the root directory. Writes go to a
//! temporary sibling file which is synced and renamed into place, so readers
//! never observe a partially written object.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{validate_key, ObjectStore};
use crate::error::StorageError;

/// Suffix of in-progress uploads; such files are never listed
const TMP_SUFFIX: &str = ".tmp-upload";

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    /// Open (and create if needed) a bucket directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Bucket root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    fn not_found(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        let data = fs::read(&path).await.map_err(|e| Self::not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut stack = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if key_prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", key_prefix, name)
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match
                    if key.starts_with(prefix) || prefix.starts_with(&format!("{}/", key)) {
                        stack.push((entry.path(), key));
                    }
                } else if !name.ends_with(TMP_SUFFIX) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;

        // Prune empty parent directories up to the root
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}
