//! Block descriptors and bucket layout
//!
//! A block is an immutable unit of stored series data covering a fixed
//! inclusive time range at one resolution. Its bytes live in object storage
//! under the block id:
//!
//! ```text
//! <block_id>/meta.json            descriptor (BlockMeta as JSON)
//! <block_id>/chunks/000001        payload (see `codec`)
//! <block_id>/deletion-mark.json   present once the block is marked
//! ```
//!
//! `meta.json` is written last on upload and removed first on deletion, so a
//! block whose descriptor is readable is always complete.

pub mod codec;

pub use codec::{AggrSample, BlockPayload, BlockSeries};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};
use ulid::Ulid;

use crate::error::{Error, MetastoreError, StorageError};
use crate::metastore::MetaStore;
use crate::objstore::ObjectStore;
use crate::types::{Labels, Resolution, TimeRange};

/// Block identifier; lexicographically sortable by creation time
pub type BlockId = Ulid;

/// Descriptor object name inside a block prefix
pub const META_FILENAME: &str = "meta.json";

/// Deletion mark object name inside a block prefix
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// Payload object path inside a block prefix
pub const CHUNKS_PATH: &str = "chunks/000001";

// =============================================================================
// Block descriptor
// =============================================================================

/// Immutable descriptor of a stored block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Unique block id
    pub block_id: BlockId,
    /// First millisecond covered (inclusive)
    pub min_time: i64,
    /// Last millisecond covered (inclusive)
    pub max_time: i64,
    /// Downsampling tier
    pub resolution: Resolution,
    /// Labels of the producing source, replica labels included
    pub external_labels: Labels,
    /// 1 for freshly ingested blocks, incremented on each merge
    pub compaction_level: u32,
    /// Blocks this one was compacted or downsampled from
    #[serde(default)]
    pub source_block_ids: BTreeSet<BlockId>,
    /// Object storage prefix of the block
    pub storage_key: String,
    /// When the block was marked for deletion (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_mark_time: Option<i64>,
}

impl BlockMeta {
    /// Descriptor for a freshly ingested raw block with a new id
    pub fn new_raw(min_time: i64, max_time: i64, external_labels: Labels) -> Self {
        Self::new(Ulid::new(), min_time, max_time, Resolution::Raw, external_labels)
    }

    /// Descriptor at compaction level 1 with no sources
    pub fn new(
        block_id: BlockId,
        min_time: i64,
        max_time: i64,
        resolution: Resolution,
        external_labels: Labels,
    ) -> Self {
        Self {
            block_id,
            min_time,
            max_time,
            resolution,
            external_labels,
            compaction_level: 1,
            source_block_ids: BTreeSet::new(),
            storage_key: block_id.to_string(),
            deletion_mark_time: None,
        }
    }

    /// Covered time range
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }

    /// Not marked for deletion
    pub fn is_active(&self) -> bool {
        self.deletion_mark_time.is_none()
    }

    /// Compaction group of this block
    pub fn group_key(&self, replica_labels: &[String]) -> GroupKey {
        GroupKey(self.external_labels.without(replica_labels))
    }

    /// Identity of the replica that produced the block
    pub fn replica(&self, replica_labels: &[String]) -> String {
        self.external_labels.replica_identity(replica_labels)
    }

    /// Check descriptor invariants
    pub fn validate(&self) -> Result<(), MetastoreError> {
        if self.min_time >= self.max_time {
            return Err(MetastoreError::InvalidBlock(format!(
                "block {}: min_time {} must be before max_time {}",
                self.block_id, self.min_time, self.max_time
            )));
        }
        if self.compaction_level == 0 {
            return Err(MetastoreError::InvalidBlock(format!(
                "block {}: compaction level must be at least 1",
                self.block_id
            )));
        }
        if self.storage_key.is_empty() {
            return Err(MetastoreError::InvalidBlock(format!(
                "block {}: empty storage key",
                self.block_id
            )));
        }
        if self.source_block_ids.contains(&self.block_id) {
            return Err(MetastoreError::InvalidBlock(format!(
                "block {} lists itself as a source",
                self.block_id
            )));
        }
        Ok(())
    }

    /// Checksum over the immutable content of the descriptor
    ///
    /// The deletion mark is excluded: marking a block does not change what
    /// the block is.
    pub fn fingerprint(&self) -> u64 {
        let mut canonical = self.clone();
        canonical.deletion_mark_time = None;
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182).checksum(&json)
    }

    /// Key of the descriptor object
    pub fn meta_key(&self) -> String {
        format!("{}/{}", self.storage_key, META_FILENAME)
    }

    /// Key of the payload object
    pub fn chunks_key(&self) -> String {
        format!("{}/{}", self.storage_key, CHUNKS_PATH)
    }

    /// Key of the deletion mark object
    pub fn deletion_mark_key(&self) -> String {
        format!("{}/{}", self.storage_key, DELETION_MARK_FILENAME)
    }
}

/// Contents of `deletion-mark.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// Marked block
    pub block_id: BlockId,
    /// Mark time (ms)
    pub deletion_time: i64,
}

// =============================================================================
// Compaction group key
// =============================================================================

/// External labels with replica labels stripped
///
/// Blocks sharing a group key hold duplicates or continuations of the same
/// logical series set and may be compacted together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Labels);

impl GroupKey {
    /// Build a key from already-stripped labels
    pub fn new(labels: Labels) -> Self {
        Self(labels)
    }

    /// Stripped labels
    pub fn labels(&self) -> &Labels {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Bucket operations
// =============================================================================

fn to_json<T: Serialize>(value: &T) -> Result<Bytes, StorageError> {
    serde_json::to_vec_pretty(value)
        .map(Bytes::from)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Check that the payload kind matches the block resolution
fn check_payload_kind(meta: &BlockMeta, payload: &BlockPayload) -> Result<(), MetastoreError> {
    let consistent = matches!(
        (meta.resolution, payload),
        (Resolution::Raw, BlockPayload::Raw(_))
            | (Resolution::FiveMinutes, BlockPayload::Aggregated(_))
            | (Resolution::OneHour, BlockPayload::Aggregated(_))
    );
    if !consistent {
        return Err(MetastoreError::InvalidBlock(format!(
            "block {}: payload kind does not match resolution {}",
            meta.block_id, meta.resolution
        )));
    }
    Ok(())
}

/// Write payload and descriptor of a block, descriptor last
///
/// Returns the keys written so a caller can clean up on a later failure.
pub async fn write_block(
    bucket: &dyn ObjectStore,
    meta: &BlockMeta,
    payload: &BlockPayload,
) -> Result<Vec<String>, Error> {
    meta.validate()?;
    check_payload_kind(meta, payload)?;

    let chunks_key = meta.chunks_key();
    bucket.put(&chunks_key, codec::encode(payload)?).await?;

    let meta_key = meta.meta_key();
    if let Err(e) = bucket.put(&meta_key, to_json(meta)?).await {
        let _ = bucket.delete(&chunks_key).await;
        return Err(e.into());
    }

    debug!(
        block_id = %meta.block_id,
        series = payload.series_count(),
        points = payload.point_count(),
        "Block written to bucket"
    );
    Ok(vec![chunks_key, meta_key])
}

/// Upload a new block and register it
///
/// Entry point for ingestion collaborators. The block is visible to queries
/// once this returns.
pub async fn upload_block(
    bucket: &dyn ObjectStore,
    metastore: &MetaStore,
    meta: BlockMeta,
    payload: &BlockPayload,
) -> Result<(), Error> {
    // Blocks are immutable: never overwrite the objects of a known id
    if let Some(existing) = metastore.get(&meta.block_id) {
        if existing.fingerprint() == meta.fingerprint() {
            return Ok(());
        }
        return Err(MetastoreError::DuplicateBlock {
            block_id: meta.block_id.to_string(),
        }
        .into());
    }

    let written = write_block(bucket, &meta, payload).await?;
    match metastore.register(meta) {
        Ok(()) => Ok(()),
        Err(e @ MetastoreError::DuplicateBlock { .. }) => Err(e.into()),
        Err(e) => {
            for key in written.iter().rev() {
                let _ = bucket.delete(key).await;
            }
            Err(e.into())
        },
    }
}

/// Read and decode the payload of a block
pub async fn read_payload(
    bucket: &dyn ObjectStore,
    meta: &BlockMeta,
) -> Result<BlockPayload, StorageError> {
    let bytes = bucket.get(&meta.chunks_key()).await?;
    codec::decode(&bytes)
}

/// Read a descriptor object
pub async fn read_meta(bucket: &dyn ObjectStore, key: &str) -> Result<BlockMeta, StorageError> {
    let bytes = bucket.get(key).await?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))
}

/// Persist a deletion mark for a block
pub async fn write_deletion_mark(
    bucket: &dyn ObjectStore,
    meta: &BlockMeta,
    deletion_time: i64,
) -> Result<(), StorageError> {
    let mark = DeletionMark {
        block_id: meta.block_id,
        deletion_time,
    };
    bucket.put(&meta.deletion_mark_key(), to_json(&mark)?).await
}

/// Read a deletion mark object
pub async fn read_deletion_mark(
    bucket: &dyn ObjectStore,
    key: &str,
) -> Result<DeletionMark, StorageError> {
    let bytes = bucket.get(key).await?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))
}

/// Remove every object of a block, descriptor first
pub async fn delete_block(bucket: &dyn ObjectStore, meta: &BlockMeta) -> Result<(), StorageError> {
    match bucket.delete(&meta.meta_key()).await {
        Ok(()) | Err(StorageError::NotFound(_)) => {},
        Err(e) => return Err(e),
    }
    let prefix = format!("{}/", meta.storage_key);
    for key in bucket.list(&prefix).await? {
        match bucket.delete(&key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {},
            Err(e) => return Err(e),
        }
    }
    info!(block_id = %meta.block_id, "Block deleted from bucket");
    Ok(())
}
