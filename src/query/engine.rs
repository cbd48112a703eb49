//! Query Federation Engine
//!
//! Turns one series query into a single deduplicated result:
//!
//! 1. pick the resolution tiers to read
//! 2. select blocks from the metadata store and live providers from the pool
//! 3. fan out to all of them under the concurrency gate
//! 4. merge fragments per deduplicated label set and drop replica duplicates
//!
//! The whole operation runs under one query timeout. When it expires the
//! fan-out future is dropped, which aborts every outstanding provider call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dedup::{merge_fragments, DedupConfig};
use super::error::{QueryError, QueryResult};
use super::resolution::{select_resolutions, ResolutionThresholds};
use super::result::{QueryResponse, QueryStats};
use crate::block::{BlockMeta, GroupKey};
use crate::metastore::MetaStore;
use crate::metrics;
use crate::objstore::ObjectStore;
use crate::store::{BlockSeriesClient, FanOutTarget, SeriesRequest, StoreClient, StorePool};
use crate::types::{LabelMatcher, Labels, Resolution, SeriesQuery, TimeRange};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Replica handling
    pub dedup: DedupConfig,

    /// Automatic resolution thresholds
    pub thresholds: ResolutionThresholds,

    /// Upper bound for a whole query
    /// Default: 2 minutes
    pub query_timeout: Duration,

    /// Whether provider failures become warnings unless a query overrides it
    /// Default: true
    pub partial_response: bool,

    /// Keep providers that only serve data coarser than the selected tiers
    /// Default: false
    pub auto_downsampling: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            thresholds: ResolutionThresholds::default(),
            query_timeout: Duration::from_secs(120),
            partial_response: true,
            auto_downsampling: false,
        }
    }
}

/// Federated query engine
pub struct QueryEngine {
    config: QueryConfig,
    metastore: Arc<MetaStore>,
    bucket: Arc<dyn ObjectStore>,
    pool: Arc<StorePool>,
}

impl QueryEngine {
    /// Create an engine over a metadata store, bucket and provider pool
    pub fn new(
        config: QueryConfig,
        metastore: Arc<MetaStore>,
        bucket: Arc<dyn ObjectStore>,
        pool: Arc<StorePool>,
    ) -> Self {
        Self {
            config,
            metastore,
            bucket,
            pool,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Execute a series query
    pub async fn query(&self, query: &SeriesQuery) -> QueryResult<QueryResponse> {
        let start = Instant::now();
        let deadline = start + self.config.query_timeout;

        let result = match tokio::time::timeout(self.config.query_timeout, self.execute(query, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::timeout(format!(
                "query [{}, {}] exceeded {:?}",
                query.min_time, query.max_time, self.config.query_timeout
            ))),
        };

        let outcome = match &result {
            Ok(response) if response.is_partial() => "partial",
            Ok(_) => "success",
            Err(e) => e.kind.as_str(),
        };
        metrics::record_query(outcome, start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(error = %e, "Query failed");
        }
        result
    }

    async fn execute(&self, query: &SeriesQuery, deadline: Instant) -> QueryResult<QueryResponse> {
        if query.min_time > query.max_time {
            return Err(QueryError::invalid(format!(
                "min_time {} is after max_time {}",
                query.min_time, query.max_time
            )));
        }

        let tiers = select_resolutions(query, &self.config.thresholds)?;
        let ceiling = tiers.last().copied().unwrap_or(Resolution::Raw);

        let (candidates, _lease) = self
            .metastore
            .list_overlapping_leased(query.min_time, query.max_time, ceiling);
        let assignments = self.plan_blocks(query, &tiers, candidates);

        let providers = self
            .pool
            .select_providers(query, ceiling, self.config.auto_downsampling);

        if assignments.is_empty() && providers.is_empty() {
            return Err(QueryError::no_providers(format!(
                "no block or provider matches {} in {}",
                format_matchers(&query.matchers),
                query.time_range()
            )));
        }

        let mut stats = QueryStats {
            resolutions: tiers.clone(),
            blocks_queried: assignments.len(),
            providers_queried: providers.len(),
            ..Default::default()
        };
        debug!(
            resolutions = ?tiers,
            blocks = stats.blocks_queried,
            providers = stats.providers_queried,
            "Query fan-out planned"
        );

        let request = Arc::new(SeriesRequest::from_query(query));
        let mut targets: Vec<FanOutTarget> = assignments
            .into_iter()
            .map(|(meta, ranges)| {
                let client: Arc<dyn StoreClient> =
                    Arc::new(BlockSeriesClient::with_ranges(Arc::clone(&self.bucket), meta, ranges));
                FanOutTarget::new(client, Arc::clone(&request))
            })
            .collect();
        targets.extend(
            providers
                .into_iter()
                .map(|client| FanOutTarget::new(client, Arc::clone(&request))),
        );

        let fan_out = self.pool.fan_out(targets, deadline).await;
        // Calls cut short by the query deadline fail the query, not just the provider
        if !fan_out.failures.is_empty() && Instant::now() >= deadline {
            return Err(QueryError::timeout(format!(
                "query [{}, {}] exceeded {:?}",
                query.min_time, query.max_time, self.config.query_timeout
            )));
        }
        stats.providers_failed = fan_out.failures.len();
        stats.fragments = fan_out.fragments.len();

        let mut warnings = Vec::new();
        if !fan_out.failures.is_empty() {
            let allowed = query.partial_response.unwrap_or(self.config.partial_response);
            if !allowed {
                let summary = fan_out
                    .failures
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut err = QueryError::partial_data(format!(
                    "{} provider call(s) failed: {}",
                    fan_out.failures.len(),
                    summary
                ));
                if let Some(first) = fan_out.failures.into_iter().next() {
                    err = err.with_source(first);
                }
                return Err(err);
            }
            for failure in &fan_out.failures {
                warn!(provider = %failure.endpoint(), error = %failure, "Partial response: provider skipped");
                warnings.push(failure.to_string());
            }
            metrics::PARTIAL_RESPONSES.inc();
        }

        let (series, dedup) = merge_fragments(fan_out.fragments, &self.config.dedup);
        stats.samples_before_dedup = dedup.input_samples;
        stats.samples_after_dedup = dedup.output_samples;
        metrics::DEDUP_SAMPLES_DROPPED.inc_by(dedup.dropped() as f64);

        Ok(QueryResponse {
            series,
            warnings,
            stats,
        })
    }

    /// Blocks to read and the sub-ranges to read from each
    ///
    /// Within a compaction group finer tiers win: a coarser block is only read
    /// for the parts of the query window that no finer block of the same
    /// group covers.
    fn plan_blocks(
        &self,
        query: &SeriesQuery,
        tiers: &[Resolution],
        candidates: Vec<BlockMeta>,
    ) -> Vec<(BlockMeta, Vec<TimeRange>)> {
        let window = query.time_range();
        let replica_labels = &self.config.dedup.replica_labels;

        let mut groups: BTreeMap<GroupKey, Vec<BlockMeta>> = BTreeMap::new();
        for meta in candidates {
            if !tiers.contains(&meta.resolution) {
                continue;
            }
            if !labels_compatible(&meta.external_labels, &query.matchers) {
                continue;
            }
            groups
                .entry(meta.group_key(replica_labels))
                .or_default()
                .push(meta);
        }

        let mut out = Vec::new();
        for (_, blocks) in groups {
            let mut covered: Vec<TimeRange> = Vec::new();
            for tier in tiers {
                let mut tier_ranges = Vec::new();
                for meta in blocks.iter().filter(|m| m.resolution == *tier) {
                    let Some(visible) = meta.time_range().intersect(&window) else {
                        continue;
                    };
                    let ranges = visible.subtract(&covered);
                    if ranges.is_empty() {
                        continue;
                    }
                    tier_ranges.push(visible);
                    out.push((meta.clone(), ranges));
                }
                covered.extend(tier_ranges);
            }
        }
        out
    }
}

/// Whether matchers on labels the block carries accept its values
fn labels_compatible(external: &Labels, matchers: &[LabelMatcher]) -> bool {
    matchers
        .iter()
        .filter(|m| external.contains(&m.name))
        .all(|m| m.matches(external))
}

fn format_matchers(matchers: &[LabelMatcher]) -> String {
    let inner = matchers
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{upload_block, BlockPayload, BlockSeries};
    use crate::objstore::InMemoryObjectStore;
    use crate::query::QueryErrorKind;
    use crate::store::StorePoolConfig;
    use crate::types::Sample;

    const HOUR: i64 = 3_600_000;

    struct Fixture {
        metastore: Arc<MetaStore>,
        bucket: Arc<dyn ObjectStore>,
        engine: QueryEngine,
    }

    fn fixture() -> Fixture {
        let metastore = Arc::new(MetaStore::new());
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let pool = Arc::new(StorePool::new(StorePoolConfig::default()));
        let engine = QueryEngine::new(
            QueryConfig::default(),
            Arc::clone(&metastore),
            Arc::clone(&bucket),
            pool,
        );
        Fixture {
            metastore,
            bucket,
            engine,
        }
    }

    async fn put_block(f: &Fixture, meta: BlockMeta, value: f64) {
        let step = ((meta.max_time - meta.min_time) / 4).max(1);
        let points: Vec<Sample> = (0..=4).map(|i| Sample::new(meta.min_time + i * step, value)).collect();
        let payload = if meta.resolution == Resolution::Raw {
            BlockPayload::Raw(vec![BlockSeries::new(Labels::from_pairs([("__name__", "up")]), points)])
        } else {
            BlockPayload::Aggregated(vec![BlockSeries::new(
                Labels::from_pairs([("__name__", "up")]),
                points
                    .iter()
                    .map(|p| crate::block::AggrSample {
                        timestamp: p.timestamp,
                        min: value,
                        max: value,
                        sum: value,
                        count: 1,
                        counter: value,
                    })
                    .collect(),
            )])
        };
        upload_block(f.bucket.as_ref(), &f.metastore, meta, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_providers_matched() {
        let f = fixture();
        let err = f.engine.query(&SeriesQuery::new(0, HOUR)).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::NoProvidersMatched);
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let f = fixture();
        let err = f.engine.query(&SeriesQuery::new(10, 0)).await.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::InvalidQuery);
    }

    #[tokio::test]
    async fn test_finer_blocks_win_per_group() {
        let f = fixture();
        let labels = Labels::from_pairs([("cluster", "eu")]);

        // raw covers [48h, 96h], 5m covers [0, 96h]
        let raw = BlockMeta::new_raw(48 * HOUR, 96 * HOUR, labels.clone());
        let mut coarse = BlockMeta::new_raw(0, 96 * HOUR, labels);
        coarse.resolution = Resolution::FiveMinutes;
        put_block(&f, raw.clone(), 1.0).await;
        put_block(&f, coarse.clone(), 5.0).await;

        let query = SeriesQuery::new(0, 96 * HOUR);
        let tiers = [Resolution::Raw, Resolution::FiveMinutes];
        let candidates = f.metastore.list_overlapping(query.min_time, query.max_time, Resolution::FiveMinutes);
        let plan = f.engine.plan_blocks(&query, &tiers, candidates);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0.block_id, raw.block_id);
        assert_eq!(plan[1].0.block_id, coarse.block_id);
        assert_eq!(plan[1].1, vec![TimeRange::new(0, 48 * HOUR - 1).unwrap()]);

        let response = f.engine.query(&query).await.unwrap();
        assert_eq!(response.series.len(), 1);
        let samples = &response.series[0].samples;
        assert!(samples.iter().filter(|s| s.timestamp < 48 * HOUR).all(|s| s.value == 5.0));
        assert!(samples.iter().filter(|s| s.timestamp >= 48 * HOUR).all(|s| s.value == 1.0));
        assert_eq!(response.stats.resolutions, vec![Resolution::Raw, Resolution::FiveMinutes]);
    }

    #[tokio::test]
    async fn test_block_label_pruning() {
        let f = fixture();
        put_block(&f, BlockMeta::new_raw(0, HOUR, Labels::from_pairs([("cluster", "eu")])), 1.0).await;
        put_block(&f, BlockMeta::new_raw(0, HOUR, Labels::from_pairs([("cluster", "us")])), 2.0).await;

        let query = SeriesQuery::new(0, HOUR).with_matcher(LabelMatcher::equal("cluster", "us"));
        let response = f.engine.query(&query).await.unwrap();
        assert_eq!(response.stats.blocks_queried, 1);
        assert!(response.series[0].samples.iter().all(|s| s.value == 2.0));
    }

    /// Holds the first read until released
    struct GatedStore {
        inner: InMemoryObjectStore,
        gated: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ObjectStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        async fn get(&self, key: &str) -> Result<bytes::Bytes, crate::error::StorageError> {
            if self.gated.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, data: bytes::Bytes) -> Result<(), crate::error::StorageError> {
            self.inner.put(key, data).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, crate::error::StorageError> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<(), crate::error::StorageError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_planned_block_not_purged_mid_query() {
        let metastore = Arc::new(MetaStore::new());
        let store = Arc::new(GatedStore {
            inner: InMemoryObjectStore::new(),
            gated: std::sync::atomic::AtomicBool::new(false),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let bucket: Arc<dyn ObjectStore> = store.clone();
        let engine = QueryEngine::new(
            QueryConfig::default(),
            Arc::clone(&metastore),
            Arc::clone(&bucket),
            Arc::new(StorePool::new(StorePoolConfig::default())),
        );
        let f = Fixture {
            metastore: Arc::clone(&metastore),
            bucket,
            engine,
        };
        let meta = BlockMeta::new_raw(0, HOUR, Labels::from_pairs([("cluster", "eu")]));
        put_block(&f, meta.clone(), 1.0).await;
        store.gated.store(true, std::sync::atomic::Ordering::SeqCst);

        let query = SeriesQuery::new(0, HOUR);
        let (response, purged) = tokio::join!(f.engine.query(&query), async {
            store.entered.notified().await;
            metastore.mark_for_deletion(&meta.block_id, 0).unwrap();
            let purged = metastore.purge_expired(0, Duration::ZERO);
            store.release.notify_one();
            purged
        });

        assert!(purged.is_empty());
        assert_eq!(response.unwrap().series.len(), 1);
        assert_eq!(metastore.purge_expired(0, Duration::ZERO).len(), 1);
    }
}
