//! Block Metadata Store
//!
//! Authoritative in-memory index of every known block. Read-heavy and
//! write-light: queries take snapshot reads while compaction registers new
//! blocks and marks old ones.
//!
//! # Concurrency
//!
//! All state sits behind one `parking_lot::RwLock`. Readers never observe a
//! half-applied compaction: [`MetaStore::commit_compaction`] registers the
//! outputs and marks the sources under a single write lock.
//!
//! # Leases
//!
//! A query that is about to read blocks takes a [`BlockLease`]. While any
//! lease on a block is alive, [`MetaStore::purge_expired`] keeps the block
//! even if its delete delay has passed.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::block::{self, BlockId, BlockMeta, DELETION_MARK_FILENAME, META_FILENAME};
use crate::error::MetastoreError;
use crate::metrics;
use crate::objstore::ObjectStore;
use crate::types::{Resolution, TimeRange};

struct Entry {
    meta: BlockMeta,
    fingerprint: u64,
}

type LeaseTable = Arc<Mutex<HashMap<BlockId, usize>>>;

/// Index of known blocks
pub struct MetaStore {
    blocks: RwLock<BTreeMap<BlockId, Entry>>,
    leases: LeaseTable,
}

/// Outcome of a bucket sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Descriptors newly registered
    pub loaded: usize,
    /// Deletion marks applied
    pub marked: usize,
    /// Descriptors that could not be read or conflicted
    pub failed: usize,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(BTreeMap::new()),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of known blocks, marked ones included
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Insert a new block descriptor
    ///
    /// Registering the same id with identical content again is a no-op.
    /// Registering it with different content fails with
    /// [`MetastoreError::DuplicateBlock`].
    pub fn register(&self, meta: BlockMeta) -> Result<(), MetastoreError> {
        meta.validate()?;
        let fingerprint = meta.fingerprint();

        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&meta.block_id) {
            if existing.fingerprint == fingerprint {
                debug!(block_id = %meta.block_id, "Block already registered");
                return Ok(());
            }
            warn!(block_id = %meta.block_id, "Rejected conflicting block registration");
            return Err(MetastoreError::DuplicateBlock {
                block_id: meta.block_id.to_string(),
            });
        }

        info!(
            block_id = %meta.block_id,
            min_time = meta.min_time,
            max_time = meta.max_time,
            resolution = %meta.resolution,
            level = meta.compaction_level,
            "Block registered"
        );
        blocks.insert(meta.block_id, Entry { meta, fingerprint });
        metrics::BLOCKS_REGISTERED.inc();
        Self::update_gauges(&blocks);
        Ok(())
    }

    /// Look up a block
    pub fn get(&self, block_id: &BlockId) -> Option<BlockMeta> {
        self.blocks.read().get(block_id).map(|e| e.meta.clone())
    }

    /// Active blocks intersecting `[min_time, max_time]` at or below `resolution_ceiling`
    ///
    /// Ordered by `min_time` ascending, then by compaction level descending
    /// (more compacted blocks are already deduplicated), then by id.
    pub fn list_overlapping(
        &self,
        min_time: i64,
        max_time: i64,
        resolution_ceiling: Resolution,
    ) -> Vec<BlockMeta> {
        Self::overlapping(&self.blocks.read(), min_time, max_time, resolution_ceiling)
    }

    /// [`MetaStore::list_overlapping`] plus a lease on every listed block
    ///
    /// Listing and leasing happen under the same read lock, so a concurrent
    /// purge either removes a block before it is listed or keeps it until
    /// the lease is dropped.
    pub fn list_overlapping_leased(
        &self,
        min_time: i64,
        max_time: i64,
        resolution_ceiling: Resolution,
    ) -> (Vec<BlockMeta>, BlockLease) {
        let blocks = self.blocks.read();
        let listed = Self::overlapping(&blocks, min_time, max_time, resolution_ceiling);
        let ids: Vec<BlockId> = listed.iter().map(|m| m.block_id).collect();
        let lease = self.lease_locked(&blocks, &ids);
        (listed, lease)
    }

    fn overlapping(
        blocks: &BTreeMap<BlockId, Entry>,
        min_time: i64,
        max_time: i64,
        resolution_ceiling: Resolution,
    ) -> Vec<BlockMeta> {
        let range = TimeRange { min_time, max_time };
        let mut out: Vec<BlockMeta> = blocks
            .values()
            .map(|e| &e.meta)
            .filter(|m| m.is_active())
            .filter(|m| m.resolution <= resolution_ceiling)
            .filter(|m| m.time_range().overlaps(&range))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.min_time
                .cmp(&b.min_time)
                .then(b.compaction_level.cmp(&a.compaction_level))
                .then(a.block_id.cmp(&b.block_id))
        });
        out
    }

    /// Snapshot of all active blocks, ordered by id
    pub fn active_blocks(&self) -> Vec<BlockMeta> {
        self.blocks
            .read()
            .values()
            .filter(|e| e.meta.is_active())
            .map(|e| e.meta.clone())
            .collect()
    }

    /// Snapshot of every known block, ordered by id
    pub fn all_blocks(&self) -> Vec<BlockMeta> {
        self.blocks.read().values().map(|e| e.meta.clone()).collect()
    }

    /// Mark a block for deletion at `at_time`
    ///
    /// Idempotent: an existing mark is kept. Returns whether the block was
    /// newly marked.
    pub fn mark_for_deletion(&self, block_id: &BlockId, at_time: i64) -> Result<bool, MetastoreError> {
        let mut blocks = self.blocks.write();
        let entry = blocks
            .get_mut(block_id)
            .ok_or_else(|| MetastoreError::BlockNotFound(block_id.to_string()))?;
        if entry.meta.deletion_mark_time.is_some() {
            return Ok(false);
        }
        entry.meta.deletion_mark_time = Some(at_time);
        info!(block_id = %block_id, at_time, "Block marked for deletion");
        metrics::BLOCKS_MARKED.inc();
        Self::update_gauges(&blocks);
        Ok(true)
    }

    /// Remove blocks whose `deletion_mark_time + delete_delay <= now`
    ///
    /// Blocks held by a live [`BlockLease`] are kept. Returns the removed
    /// descriptors so the caller can delete their objects.
    pub fn purge_expired(&self, now: i64, delete_delay: Duration) -> Vec<BlockMeta> {
        let delay_ms = i64::try_from(delete_delay.as_millis()).unwrap_or(i64::MAX);
        let mut blocks = self.blocks.write();
        let leases = self.leases.lock();

        let expired: Vec<BlockId> = blocks
            .values()
            .filter(|e| {
                e.meta
                    .deletion_mark_time
                    .is_some_and(|marked| marked.saturating_add(delay_ms) <= now)
            })
            .map(|e| e.meta.block_id)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if leases.get(&id).copied().unwrap_or(0) > 0 {
                debug!(block_id = %id, "Purge deferred, block is leased by a query");
                continue;
            }
            if let Some(entry) = blocks.remove(&id) {
                info!(block_id = %id, "Block purged from metadata store");
                removed.push(entry.meta);
            }
        }
        metrics::BLOCKS_PURGED.inc_by(removed.len() as f64);
        removed
    }

    /// Take a lease on the given blocks
    ///
    /// Unknown ids are skipped. The lease is released on drop.
    pub fn acquire(&self, block_ids: &[BlockId]) -> BlockLease {
        self.lease_locked(&self.blocks.read(), block_ids)
    }

    /// Caller holds the blocks read lock
    fn lease_locked(&self, blocks: &BTreeMap<BlockId, Entry>, block_ids: &[BlockId]) -> BlockLease {
        let mut leases = self.leases.lock();
        let held: Vec<BlockId> = block_ids
            .iter()
            .filter(|id| blocks.contains_key(id))
            .copied()
            .collect();
        for id in &held {
            *leases.entry(*id).or_insert(0) += 1;
        }
        BlockLease {
            table: Arc::clone(&self.leases),
            block_ids: held,
        }
    }

    /// Number of live leases on a block
    pub fn lease_count(&self, block_id: &BlockId) -> usize {
        self.leases.lock().get(block_id).copied().unwrap_or(0)
    }

    /// Register compaction outputs and mark their sources in one step
    ///
    /// Every source must exist and be active; every output must be new.
    /// Nothing is changed when any check fails.
    pub fn commit_compaction(
        &self,
        outputs: Vec<BlockMeta>,
        mark_sources: &[BlockId],
        at_time: i64,
    ) -> Result<(), MetastoreError> {
        let mut prepared = Vec::with_capacity(outputs.len());
        for meta in outputs {
            meta.validate()?;
            let fingerprint = meta.fingerprint();
            prepared.push(Entry { meta, fingerprint });
        }

        let mut blocks = self.blocks.write();
        for id in mark_sources {
            match blocks.get(id) {
                None => return Err(MetastoreError::BlockNotFound(id.to_string())),
                Some(e) if !e.meta.is_active() => {
                    return Err(MetastoreError::InvalidBlock(format!(
                        "source block {} is already marked for deletion",
                        id
                    )))
                },
                Some(_) => {},
            }
        }
        for entry in &prepared {
            if blocks.contains_key(&entry.meta.block_id) {
                return Err(MetastoreError::DuplicateBlock {
                    block_id: entry.meta.block_id.to_string(),
                });
            }
        }

        for entry in prepared {
            info!(
                block_id = %entry.meta.block_id,
                sources = entry.meta.source_block_ids.len(),
                resolution = %entry.meta.resolution,
                level = entry.meta.compaction_level,
                "Compacted block registered"
            );
            blocks.insert(entry.meta.block_id, entry);
            metrics::BLOCKS_REGISTERED.inc();
        }
        for id in mark_sources {
            if let Some(e) = blocks.get_mut(id) {
                e.meta.deletion_mark_time = Some(at_time);
                metrics::BLOCKS_MARKED.inc();
            }
        }
        Self::update_gauges(&blocks);
        Ok(())
    }

    /// Load descriptors and deletion marks from the bucket
    ///
    /// Blocks already known are left untouched apart from applying deletion
    /// marks found in the bucket. Unreadable or conflicting descriptors are
    /// logged and counted, not fatal.
    pub async fn sync_from_bucket(&self, bucket: &dyn ObjectStore) -> Result<SyncStats, MetastoreError> {
        let keys = bucket.list("").await?;
        let mut stats = SyncStats::default();

        let meta_suffix = format!("/{}", META_FILENAME);
        let mark_suffix = format!("/{}", DELETION_MARK_FILENAME);

        for key in keys.iter().filter(|k| k.ends_with(&meta_suffix)) {
            let meta = match block::read_meta(bucket, key).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable block descriptor");
                    stats.failed += 1;
                    continue;
                },
            };
            if self.blocks.read().contains_key(&meta.block_id) {
                continue;
            }
            match self.register(meta) {
                Ok(()) => stats.loaded += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping block descriptor");
                    stats.failed += 1;
                },
            }
        }

        for key in keys.iter().filter(|k| k.ends_with(&mark_suffix)) {
            match block::read_deletion_mark(bucket, key).await {
                Ok(mark) => match self.mark_for_deletion(&mark.block_id, mark.deletion_time) {
                    Ok(true) => stats.marked += 1,
                    Ok(false) => {},
                    Err(e) => debug!(key = %key, error = %e, "Deletion mark for unknown block"),
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable deletion mark");
                    stats.failed += 1;
                },
            }
        }

        info!(
            loaded = stats.loaded,
            marked = stats.marked,
            failed = stats.failed,
            "Metadata store synced from bucket"
        );
        Ok(stats)
    }

    fn update_gauges(blocks: &BTreeMap<BlockId, Entry>) {
        for resolution in Resolution::ALL {
            let count = blocks
                .values()
                .filter(|e| e.meta.is_active() && e.meta.resolution == resolution)
                .count();
            metrics::update_active_blocks(resolution.as_str(), count);
        }
    }
}

/// Keeps leased blocks from being purged until dropped
#[must_use = "blocks are only protected while the lease is alive"]
pub struct BlockLease {
    table: LeaseTable,
    block_ids: Vec<BlockId>,
}

impl BlockLease {
    /// Leased block ids
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        for id in &self.block_ids {
            if let Some(count) = table.get_mut(id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    table.remove(id);
                }
            }
        }
    }
}
