//! Query Federation Integration Tests
//!
//! # Test Coverage
//!
//! 1. **Partial response** - failing providers become warnings or errors
//! 2. **Timeouts** - slow providers cannot hold a query past its deadline
//! 3. **Resolution selection** - range length picks the block tiers read
//! 4. **Live + block data** - head data and compacted blocks merge into one series

use async_trait::async_trait;
use panorama_tsdb::{
    block::{self, AggrSample, BlockMeta, BlockPayload, BlockSeries},
    error::StoreError,
    metastore::MetaStore,
    objstore::{InMemoryObjectStore, ObjectStore},
    query::{select_resolutions, QueryConfig, QueryEngine, QueryErrorKind, ResolutionThresholds},
    retry::RetryPolicy,
    store::{InMemoryStoreClient, ProviderInfo, SeriesRequest, StoreClient, StorePool, StorePoolConfig},
    types::{Aggr, LabelMatcher, Labels, Resolution, Sample, SeriesFragment, SeriesQuery, TimeRange},
};
use std::sync::Arc;
use std::time::Duration;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

// =============================================================================
// Test Providers
// =============================================================================

/// Provider that always fails
struct BrokenStore {
    endpoint: String,
}

#[async_trait]
impl StoreClient for BrokenStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn series(&self, _request: &SeriesRequest) -> Result<Vec<SeriesFragment>, StoreError> {
        Err(StoreError::Rejected {
            endpoint: self.endpoint.clone(),
            message: "permission denied".to_string(),
        })
    }
}

/// Provider that never answers in time
struct StalledStore {
    endpoint: String,
}

#[async_trait]
impl StoreClient for StalledStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn series(&self, _request: &SeriesRequest) -> Result<Vec<SeriesFragment>, StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

fn info(endpoint: &str, cluster: &str) -> ProviderInfo {
    ProviderInfo {
        endpoint: endpoint.to_string(),
        label_sets: vec![Labels::from_pairs([("cluster", cluster)])],
        time_range: TimeRange {
            min_time: 0,
            max_time: 30 * DAY,
        },
        min_resolution: Resolution::Raw,
    }
}

fn live_provider(endpoint: &str, cluster: &str, replica: &str) -> Arc<InMemoryStoreClient> {
    let client = InMemoryStoreClient::new(endpoint, Labels::from_pairs([("cluster", cluster), ("replica", replica)]));
    client.append(
        Labels::from_pairs([("__name__", "up"), ("job", "node")]),
        (0..10).map(|i| Sample::new(i * 15_000, 1.0)),
    );
    Arc::new(client)
}

fn engine_with(pool: StorePool, config: QueryConfig) -> (QueryEngine, Arc<MetaStore>, Arc<dyn ObjectStore>) {
    let metastore = Arc::new(MetaStore::new());
    let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let engine = QueryEngine::new(config, metastore.clone(), bucket.clone(), Arc::new(pool));
    (engine, metastore, bucket)
}

fn no_retry_pool() -> StorePool {
    StorePool::new(StorePoolConfig {
        retry: RetryPolicy::none(),
        ..Default::default()
    })
}

fn up_query() -> SeriesQuery {
    SeriesQuery::new(0, HOUR).with_matcher(LabelMatcher::equal("__name__", "up"))
}

// =============================================================================
// Partial Response
// =============================================================================

#[tokio::test]
async fn test_partial_response_returns_warnings() {
    let pool = no_retry_pool();
    let healthy = live_provider("sidecar-eu-0:10901", "eu", "0");
    pool.register_provider(healthy.info(), healthy);
    pool.register_provider(
        info("sidecar-us-0:10901", "us"),
        Arc::new(BrokenStore {
            endpoint: "sidecar-us-0:10901".to_string(),
        }),
    );
    let (engine, _, _) = engine_with(pool, QueryConfig::default());

    let response = engine.query(&up_query()).await.expect("partial result");
    assert!(response.is_partial());
    assert_eq!(response.warnings.len(), 1);
    assert!(response.warnings[0].contains("sidecar-us-0:10901"));
    assert_eq!(response.stats.providers_failed, 1);
    assert_eq!(response.series.len(), 1);
    assert_eq!(response.series[0].samples.len(), 10);
}

#[tokio::test]
async fn test_partial_response_disabled_per_query() {
    let pool = no_retry_pool();
    let healthy = live_provider("sidecar-eu-0:10901", "eu", "0");
    pool.register_provider(healthy.info(), healthy);
    pool.register_provider(
        info("sidecar-us-0:10901", "us"),
        Arc::new(BrokenStore {
            endpoint: "sidecar-us-0:10901".to_string(),
        }),
    );
    let (engine, _, _) = engine_with(pool, QueryConfig::default());

    let err = engine
        .query(&up_query().with_partial_response(false))
        .await
        .expect_err("strict query fails");
    assert_eq!(err.kind, QueryErrorKind::PartialData);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_label_pruning_skips_broken_provider() {
    let pool = no_retry_pool();
    let healthy = live_provider("sidecar-eu-0:10901", "eu", "0");
    pool.register_provider(healthy.info(), healthy);
    pool.register_provider(
        info("sidecar-us-0:10901", "us"),
        Arc::new(BrokenStore {
            endpoint: "sidecar-us-0:10901".to_string(),
        }),
    );
    let (engine, _, _) = engine_with(pool, QueryConfig::default());

    // The broken provider only serves cluster="us", so it is never called
    let query = up_query()
        .with_matcher(LabelMatcher::equal("cluster", "eu"))
        .with_partial_response(false);
    let response = engine.query(&query).await.expect("pruned query");
    assert!(!response.is_partial());
    assert_eq!(response.stats.providers_queried, 1);
}

#[tokio::test]
async fn test_nothing_matches() {
    let (engine, _, _) = engine_with(no_retry_pool(), QueryConfig::default());
    let err = engine.query(&up_query()).await.expect_err("no providers");
    assert_eq!(err.kind, QueryErrorKind::NoProvidersMatched);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_stalled_provider_hits_query_timeout() {
    let pool = no_retry_pool();
    pool.register_provider(
        info("sidecar-eu-0:10901", "eu"),
        Arc::new(StalledStore {
            endpoint: "sidecar-eu-0:10901".to_string(),
        }),
    );
    let config = QueryConfig {
        query_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let (engine, _, _) = engine_with(pool, config);

    let started = std::time::Instant::now();
    let err = engine.query(&up_query()).await.expect_err("timeout");
    assert_eq!(err.kind, QueryErrorKind::Timeout);
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stalled_provider_hits_per_provider_timeout() {
    let pool = StorePool::new(StorePoolConfig {
        per_provider_timeout: Duration::from_millis(50),
        retry: RetryPolicy::none(),
        ..Default::default()
    });
    let healthy = live_provider("sidecar-eu-0:10901", "eu", "0");
    pool.register_provider(healthy.info(), healthy);
    pool.register_provider(
        info("sidecar-eu-1:10901", "eu"),
        Arc::new(StalledStore {
            endpoint: "sidecar-eu-1:10901".to_string(),
        }),
    );
    let (engine, _, _) = engine_with(pool, QueryConfig::default());

    let response = engine.query(&up_query()).await.expect("partial result");
    assert!(response.is_partial());
    assert!(response.warnings[0].contains("timed out"));
    assert_eq!(response.series[0].samples.len(), 10);
}

// =============================================================================
// Resolution Selection
// =============================================================================

#[test]
fn test_auto_selection_by_range() {
    let thresholds = ResolutionThresholds::default();
    let tiers = |range: i64| select_resolutions(&SeriesQuery::new(0, range), &thresholds).unwrap();

    assert_eq!(tiers(10 * HOUR), vec![Resolution::Raw]);
    assert_eq!(tiers(100 * HOUR), vec![Resolution::Raw, Resolution::FiveMinutes]);
    assert_eq!(tiers(15 * DAY), vec![Resolution::FiveMinutes, Resolution::OneHour]);
}

#[test]
fn test_conflicting_resolution_bounds() {
    let query = SeriesQuery::new(0, HOUR)
        .with_min_resolution(Resolution::OneHour)
        .with_max_resolution(Resolution::Raw);
    let err = select_resolutions(&query, &ResolutionThresholds::default()).unwrap_err();
    assert_eq!(err.kind, QueryErrorKind::AmbiguousResolution);
}

#[tokio::test]
async fn test_long_range_reads_downsampled_blocks() {
    let (engine, metastore, bucket) = engine_with(no_retry_pool(), QueryConfig::default());
    let labels = Labels::from_pairs([("cluster", "eu"), ("replica", "0")]);

    // Raw block is excluded from a 15d query, the 5m block is read
    let raw = BlockMeta::new_raw(0, 2 * HOUR, labels.clone());
    let raw_payload = BlockPayload::Raw(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "up")]),
        vec![Sample::new(0, 1.0)],
    )]);
    block::upload_block(bucket.as_ref(), &metastore, raw, &raw_payload).await.unwrap();

    let five = BlockMeta::new(ulid::Ulid::new(), 0, 15 * DAY, Resolution::FiveMinutes, labels);
    let five_payload = BlockPayload::Aggregated(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "up")]),
        vec![AggrSample {
            timestamp: 299_999,
            min: 1.0,
            max: 3.0,
            sum: 8.0,
            count: 4,
            counter: 0.0,
        }],
    )]);
    block::upload_block(bucket.as_ref(), &metastore, five, &five_payload).await.unwrap();

    let query = SeriesQuery::new(0, 15 * DAY).with_aggregate(Aggr::Max);
    let response = engine.query(&query).await.unwrap();
    assert_eq!(response.stats.resolutions, vec![Resolution::FiveMinutes, Resolution::OneHour]);
    assert_eq!(response.stats.blocks_queried, 1);
    assert_eq!(response.series[0].samples, vec![Sample::new(299_999, 3.0)]);
}

// =============================================================================
// Live + Block Data
// =============================================================================

#[tokio::test]
async fn test_live_and_block_data_merge() {
    let pool = no_retry_pool();
    let live = Arc::new(InMemoryStoreClient::new(
        "sidecar-eu-1:10901",
        Labels::from_pairs([("cluster", "eu"), ("replica", "1")]),
    ));
    live.append(
        Labels::from_pairs([("__name__", "up")]),
        [Sample::new(HOUR + 15_000, 1.0), Sample::new(HOUR + 30_000, 1.0)],
    );
    pool.register_provider(live.info(), live);
    let (engine, metastore, bucket) = engine_with(pool, QueryConfig::default());

    let meta = BlockMeta::new_raw(0, HOUR, Labels::from_pairs([("cluster", "eu"), ("replica", "0")]));
    let payload = BlockPayload::Raw(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "up")]),
        vec![Sample::new(0, 1.0), Sample::new(HOUR, 1.0)],
    )]);
    block::upload_block(bucket.as_ref(), &metastore, meta, &payload).await.unwrap();

    let response = engine.query(&SeriesQuery::new(0, 2 * HOUR)).await.unwrap();
    assert_eq!(response.series.len(), 1);
    assert_eq!(response.series[0].labels, Labels::from_pairs([("__name__", "up"), ("cluster", "eu")]));
    let ts: Vec<i64> = response.series[0].samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![0, HOUR, HOUR + 15_000, HOUR + 30_000]);
}

// =============================================================================
// Block Upload
// =============================================================================

#[tokio::test]
async fn test_block_ids_are_immutable() {
    let (engine, metastore, bucket) = engine_with(no_retry_pool(), QueryConfig::default());
    let meta = BlockMeta::new_raw(0, HOUR, Labels::from_pairs([("cluster", "eu"), ("replica", "0")]));
    let payload = BlockPayload::Raw(vec![BlockSeries::new(
        Labels::from_pairs([("__name__", "up")]),
        vec![Sample::new(0, 1.0)],
    )]);
    block::upload_block(bucket.as_ref(), &metastore, meta.clone(), &payload).await.unwrap();

    // Identical descriptor: no-op
    block::upload_block(bucket.as_ref(), &metastore, meta.clone(), &payload).await.unwrap();

    // Same id, different content: rejected, original untouched
    let mut changed = meta.clone();
    changed.max_time = 2 * HOUR;
    let err = block::upload_block(bucket.as_ref(), &metastore, changed, &payload)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        panorama_tsdb::Error::Metastore(panorama_tsdb::error::MetastoreError::DuplicateBlock { .. })
    ));
    assert_eq!(metastore.get(&meta.block_id), Some(meta));

    let response = engine.query(&SeriesQuery::new(0, HOUR)).await.unwrap();
    assert_eq!(response.series[0].samples, vec![Sample::new(0, 1.0)]);
}
