//! Compaction Integration Tests
//!
//! # Test Coverage
//!
//! 1. **Group exclusivity** - a second job of a busy group is refused
//! 2. **Failure halting** - repeated failures halt a group until resumed
//! 3. **Purge** - marked blocks outlive their delay while a query holds them
//! 4. **Downsampling** - counter resets survive aggregation
//! 5. **Horizontal merge** - adjacent blocks become one covering both
//! 6. **Vertical 5m merge** - replicas of a downsampled tier merge per window

use async_trait::async_trait;
use bytes::Bytes;
use panorama_tsdb::{
    block::{self, codec, AggrSample, BlockMeta, BlockPayload, BlockSeries},
    compact::{CompactionConfig, CompactionService, Executor, JobKind, Planner},
    error::{CompactionError, StorageError},
    metastore::MetaStore,
    objstore::{InMemoryObjectStore, ObjectStore},
    query::{QueryConfig, QueryEngine},
    store::{StorePool, StorePoolConfig},
    types::{now_ms, Aggr, Labels, Resolution, Sample, SeriesQuery},
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

const HOUR: i64 = 3_600_000;

// =============================================================================
// Test Helpers
// =============================================================================

/// Bucket whose reads take a while
struct SlowStore {
    inner: InMemoryObjectStore,
    delay: Duration,
}

#[async_trait]
impl ObjectStore for SlowStore {
    fn name(&self) -> &str {
        "slow"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.inner.put(key, data).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

fn replica_labels(replica: &str) -> Labels {
    Labels::from_pairs([("cluster", "eu"), ("replica", replica)])
}

fn raw_payload(samples: Vec<Sample>) -> BlockPayload {
    BlockPayload::Raw(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "requests_total")]),
        samples,
    )])
}

fn steady(min_time: i64, max_time: i64, value: f64) -> Vec<Sample> {
    (min_time..=max_time)
        .step_by(60_000)
        .map(|t| Sample::new(t, value))
        .collect()
}

async fn upload(
    bucket: &dyn ObjectStore,
    metastore: &MetaStore,
    meta: BlockMeta,
    payload: &BlockPayload,
) -> BlockMeta {
    block::upload_block(bucket, metastore, meta.clone(), payload)
        .await
        .expect("upload block");
    meta
}

// =============================================================================
// Group Exclusivity
// =============================================================================

#[tokio::test]
async fn test_second_job_of_busy_group_is_refused() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(SlowStore {
        inner: InMemoryObjectStore::new(),
        delay: Duration::from_millis(200),
    });
    let payload = raw_payload(steady(0, HOUR, 1.0));
    upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("0")), &payload).await;
    upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("1")), &payload).await;

    let config = CompactionConfig::default();
    let now = now_ms();
    let jobs = Planner::new(config.clone()).plan(&metastore.all_blocks(), now, &HashSet::new());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Vertical);

    let executor = Executor::new(config, metastore.clone(), bucket.clone());
    let (first, second) = tokio::join!(executor.execute(&jobs[0], now), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.execute(&jobs[0], now).await
    });

    assert!(first.is_ok(), "first job: {:?}", first);
    assert!(matches!(second, Err(CompactionError::GroupBusy(_))));
    assert_eq!(metastore.active_blocks().len(), 1);
}

// =============================================================================
// Failure Halting
// =============================================================================

#[tokio::test]
async fn test_group_halts_after_repeated_failures() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let payload = raw_payload(steady(0, HOUR, 1.0));
    let a = upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("0")), &payload).await;
    upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("1")), &payload).await;

    // Payload of A disappears: every merge of the group fails
    bucket.delete(&a.chunks_key()).await.unwrap();

    let config = CompactionConfig {
        max_consecutive_failures: 2,
        ..Default::default()
    };
    let group = a.group_key(&config.replica_labels);
    let service = CompactionService::new(config, metastore.clone(), bucket.clone());

    let first = service.run_once().await;
    assert_eq!(first.failures.len(), 1);
    assert!(matches!(first.failures[0].1, CompactionError::Storage(StorageError::NotFound(_))));
    assert!(first.halted.is_empty());
    assert_eq!(service.failures().failures(&group), 1);

    let second = service.run_once().await;
    assert_eq!(second.failures.len(), 1);
    assert_eq!(second.halted, vec![group.clone()]);
    assert!(service.failures().is_halted(&group));

    // Halted: nothing planned, sources untouched
    let third = service.run_once().await;
    assert_eq!(third.planned, 0);
    assert_eq!(metastore.active_blocks().len(), 2);
    assert_eq!(bucket.list("").await.unwrap().len(), 3);

    // Repair and resume
    bucket
        .put(&a.chunks_key(), codec::encode(&payload).unwrap())
        .await
        .unwrap();
    assert!(service.resume_group(&group));
    assert!(!service.resume_group(&group));

    let fourth = service.run_once().await;
    assert!(fourth.failures.is_empty());
    assert_eq!(fourth.outputs.len(), 1);
    assert_eq!(service.failures().failures(&group), 0);
    assert_eq!(service.stats().jobs_failed, 2);
}

// =============================================================================
// Purge
// =============================================================================

#[tokio::test]
async fn test_purge_waits_for_leases() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let payload = raw_payload(steady(0, HOUR, 1.0));
    let a = upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("0")), &payload).await;
    let b = upload(bucket.as_ref(), &metastore, BlockMeta::new_raw(0, HOUR, replica_labels("1")), &payload).await;

    let config = CompactionConfig {
        delete_delay: Duration::ZERO,
        downsampling_enabled: false,
        ..Default::default()
    };
    let service = CompactionService::new(config, metastore.clone(), bucket.clone());

    let merged = service.run_once().await;
    assert_eq!(merged.outputs.len(), 1);
    assert_eq!(merged.purged, 0);

    // A query still reads A
    let lease = metastore.acquire(&[a.block_id]);
    let second = service.run_once().await;
    assert_eq!(second.purged, 1);
    assert!(metastore.get(&a.block_id).is_some());
    assert!(bucket.exists(&a.meta_key()).await.unwrap());
    assert!(metastore.get(&b.block_id).is_none());
    assert!(!bucket.exists(&b.meta_key()).await.unwrap());
    assert!(!bucket.exists(&b.chunks_key()).await.unwrap());

    drop(lease);
    let third = service.run_once().await;
    assert_eq!(third.purged, 1);
    assert!(metastore.get(&a.block_id).is_none());
    assert!(!bucket.exists(&a.meta_key()).await.unwrap());
    assert_eq!(service.stats().blocks_purged, 2);
}

// =============================================================================
// Downsampling
// =============================================================================

#[tokio::test]
async fn test_counter_reset_survives_downsampling() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let samples = vec![
        Sample::new(0, 100.0),
        Sample::new(15_000, 150.0),
        Sample::new(30_000, 30.0),
        Sample::new(45_000, 80.0),
    ];
    let raw = upload(
        bucket.as_ref(),
        &metastore,
        BlockMeta::new_raw(0, 60_000, Labels::from_pairs([("cluster", "eu")])),
        &raw_payload(samples),
    )
    .await;

    let config = CompactionConfig::default();
    let service = CompactionService::new(config, metastore.clone(), bucket.clone());
    let report = service.run_once().await;
    assert_eq!(report.outputs.len(), 1);

    let five = &report.outputs[0];
    assert_eq!(five.resolution, Resolution::FiveMinutes);
    assert_eq!(five.source_block_ids, BTreeSet::from([raw.block_id]));
    assert!(metastore.get(&raw.block_id).unwrap().is_active());

    let BlockPayload::Aggregated(series) = block::read_payload(bucket.as_ref(), five).await.unwrap() else {
        panic!("5m block must hold aggregates");
    };
    assert_eq!(series.len(), 1);
    let window = series[0].points[0];
    assert_eq!(window.timestamp, 45_000);
    assert_eq!(window.count, 4);
    assert_eq!(window.min, 30.0);
    assert_eq!(window.max, 150.0);
    assert_eq!(window.sum, 360.0);
    assert_eq!(window.counter, 230.0);

    // Read back through the query path at 5m resolution
    let engine = QueryEngine::new(
        QueryConfig::default(),
        metastore.clone(),
        bucket.clone(),
        Arc::new(StorePool::new(StorePoolConfig::default())),
    );
    let query = SeriesQuery::new(0, HOUR)
        .with_min_resolution(Resolution::FiveMinutes)
        .with_aggregate(Aggr::Counter);
    let response = engine.query(&query).await.unwrap();
    assert_eq!(response.stats.resolutions, vec![Resolution::FiveMinutes]);
    assert_eq!(response.series[0].samples, vec![Sample::new(45_000, 230.0)]);
}

// =============================================================================
// Horizontal Merge
// =============================================================================

#[tokio::test]
async fn test_horizontal_merge_covers_union() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let first = upload(
        bucket.as_ref(),
        &metastore,
        BlockMeta::new_raw(0, HOUR - 1, replica_labels("0")),
        &raw_payload(steady(0, HOUR - 1, 1.0)),
    )
    .await;
    let second = upload(
        bucket.as_ref(),
        &metastore,
        BlockMeta::new_raw(HOUR, 2 * HOUR - 1, replica_labels("0")),
        &raw_payload(steady(HOUR, 2 * HOUR - 1, 2.0)),
    )
    .await;

    let config = CompactionConfig::default();
    let jobs = Planner::new(config.clone()).plan(&metastore.all_blocks(), now_ms(), &HashSet::new());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Horizontal);

    let service = CompactionService::new(config, metastore.clone(), bucket.clone());
    let report = service.run_once().await;
    assert_eq!(report.outputs.len(), 1);

    let merged = &report.outputs[0];
    assert_eq!((merged.min_time, merged.max_time), (0, 2 * HOUR - 1));
    assert_eq!(merged.compaction_level, 2);
    assert_eq!(merged.external_labels, replica_labels("0"));
    assert_eq!(merged.source_block_ids, BTreeSet::from([first.block_id, second.block_id]));

    let BlockPayload::Raw(series) = block::read_payload(bucket.as_ref(), merged).await.unwrap() else {
        panic!("merged raw block must hold raw samples");
    };
    assert_eq!(series[0].points.len(), 120);
    assert_eq!(series[0].points[59].value, 1.0);
    assert_eq!(series[0].points[60].value, 2.0);
}

// =============================================================================
// Vertical 5m Merge
// =============================================================================

const FIVE_MIN: i64 = 300_000;

/// 5m aggregates for `windows`, each stamped `offset` into its window
fn five_minute_payload(windows: std::ops::Range<i64>, offset: i64, value: f64) -> BlockPayload {
    BlockPayload::Aggregated(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "requests_total")]),
        windows
            .map(|w| AggrSample {
                timestamp: w * FIVE_MIN + offset,
                min: value,
                max: value,
                sum: value,
                count: 1,
                counter: value,
            })
            .collect(),
    )])
}

fn five_minute_block(replica: &str) -> BlockMeta {
    let mut meta = BlockMeta::new_raw(0, 12 * FIVE_MIN - 1, replica_labels(replica));
    meta.resolution = Resolution::FiveMinutes;
    meta
}

fn vertical_only() -> CompactionConfig {
    CompactionConfig {
        downsampling_enabled: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_vertical_five_minute_merge_one_point_per_window() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    // replicas stamp their windows with their own last scrape time
    upload(bucket.as_ref(), &metastore, five_minute_block("0"), &five_minute_payload(0..2, 299_000, 1.0)).await;
    upload(bucket.as_ref(), &metastore, five_minute_block("1"), &five_minute_payload(0..12, 298_500, 2.0)).await;

    let service = CompactionService::new(vertical_only(), metastore.clone(), bucket.clone());
    let report = service.run_once().await;
    assert_eq!(report.outputs.len(), 1);
    let merged = &report.outputs[0];
    assert_eq!(merged.resolution, Resolution::FiveMinutes);
    assert_eq!(metastore.active_blocks().len(), 1);

    let BlockPayload::Aggregated(series) = block::read_payload(bucket.as_ref(), merged).await.unwrap() else {
        panic!("5m block must hold aggregates");
    };
    let points = &series[0].points;
    assert_eq!(points.len(), 12);
    let windows: Vec<i64> = points.iter().map(|p| p.timestamp.div_euclid(FIVE_MIN)).collect();
    assert_eq!(windows, (0..12).collect::<Vec<_>>());
    assert_eq!(points.iter().map(|p| p.count).sum::<u64>(), 12);
    // the replica without gaps supplies every window
    assert!(points.iter().all(|p| p.sum == 2.0 && p.timestamp % FIVE_MIN == 298_500));
}

#[tokio::test]
async fn test_vertical_five_minute_merge_matches_query_dedup() {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    upload(bucket.as_ref(), &metastore, five_minute_block("0"), &five_minute_payload(0..2, 299_000, 1.0)).await;
    upload(bucket.as_ref(), &metastore, five_minute_block("1"), &five_minute_payload(0..12, 299_000, 2.0)).await;

    let engine = QueryEngine::new(
        QueryConfig::default(),
        metastore.clone(),
        bucket.clone(),
        Arc::new(StorePool::new(StorePoolConfig::default())),
    );
    let query = SeriesQuery::new(0, HOUR)
        .with_min_resolution(Resolution::FiveMinutes)
        .with_aggregate(Aggr::Max);

    let before = engine.query(&query).await.unwrap();
    assert_eq!(before.series.len(), 1);
    assert_eq!(before.series[0].samples.len(), 12);

    let service = CompactionService::new(vertical_only(), metastore.clone(), bucket.clone());
    assert_eq!(service.run_once().await.outputs.len(), 1);

    let after = engine.query(&query).await.unwrap();
    assert_eq!(after.series, before.series);
    assert!(after.series[0].samples.iter().all(|s| s.value == 2.0));
}
