//! Compaction job execution
//!
//! A job either completes fully or leaves no trace:
//!
//! 1. read every source payload
//! 2. merge (vertical / horizontal) or aggregate (downsample)
//! 3. write the new block, then deletion marks for merged sources
//! 4. commit output and marks to the metadata store in one step
//!
//! If any step fails, objects written by the job are deleted again and the
//! metadata store is left untouched.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::downsample::{downsample_aggregated, downsample_raw};
use super::planner::{CompactionJob, JobKind};
use super::CompactionConfig;
use crate::block::{self, AggrSample, BlockId, BlockMeta, BlockPayload, BlockSeries, GroupKey};
use crate::error::{CompactionError, Error};
use crate::metastore::MetaStore;
use crate::metrics;
use crate::objstore::ObjectStore;
use crate::query::dedup::{replica_order, ReplicaTimeline};
use crate::query::{merge_fragments, DedupConfig, DedupFunction};
use crate::types::{Labels, Resolution, SeriesFragment};

/// Runs compaction jobs against a bucket and a metadata store
pub struct Executor {
    config: CompactionConfig,
    metastore: Arc<MetaStore>,
    bucket: Arc<dyn ObjectStore>,
    /// Ceiling on concurrently executing jobs
    slots: Arc<Semaphore>,
    /// One lock per group; a held lock means a job is in flight
    group_locks: DashMap<GroupKey, Arc<Mutex<()>>>,
}

impl Executor {
    /// Create an executor
    pub fn new(config: CompactionConfig, metastore: Arc<MetaStore>, bucket: Arc<dyn ObjectStore>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config,
            metastore,
            bucket,
            slots,
            group_locks: DashMap::new(),
        }
    }

    /// Execute one job, returning the descriptor of the new block
    ///
    /// Fails with [`CompactionError::GroupBusy`] when another job of the same
    /// group is running.
    pub async fn execute(&self, job: &CompactionJob, now: i64) -> Result<BlockMeta, CompactionError> {
        let lock = self.group_locks.entry(job.group.clone()).or_default().clone();
        let group_guard = lock
            .try_lock_owned()
            .map_err(|_| CompactionError::GroupBusy(job.group.to_string()))?;

        let start = Instant::now();
        let result = match self.slots.acquire().await {
            Ok(_slot) => self.run(job, now).await,
            Err(_) => Err(CompactionError::InvalidJob("executor closed".to_string())),
        };
        let elapsed = start.elapsed().as_secs_f64();

        drop(group_guard);
        self.group_locks
            .remove_if(&job.group, |_, lock| Arc::strong_count(lock) == 1);
        metrics::record_compaction(job.kind.as_str(), elapsed, result.is_ok());

        match &result {
            Ok(meta) => info!(
                job_id = job.id,
                kind = %job.kind,
                group = %job.group,
                block_id = %meta.block_id,
                sources = job.sources.len(),
                duration_secs = elapsed,
                "Compaction job completed"
            ),
            Err(e) => warn!(
                job_id = job.id,
                kind = %job.kind,
                group = %job.group,
                error = %e,
                "Compaction job failed"
            ),
        }
        result
    }

    async fn run(&self, job: &CompactionJob, now: i64) -> Result<BlockMeta, CompactionError> {
        self.check_sources(job)?;

        let mut payloads = Vec::with_capacity(job.sources.len());
        for source in &job.sources {
            let payload = block::read_payload(self.bucket.as_ref(), source).await?;
            payloads.push((source, payload));
        }

        let (meta, payload) = match job.kind {
            JobKind::Vertical | JobKind::Horizontal => self.merge(job, payloads)?,
            JobKind::Downsample => downsample(job, payloads)?,
        };
        debug!(
            job_id = job.id,
            block_id = %meta.block_id,
            series = payload.series_count(),
            points = payload.point_count(),
            "Compaction output built"
        );

        let mut written = block::write_block(self.bucket.as_ref(), &meta, &payload)
            .await
            .map_err(|e| match e {
                Error::Storage(e) => CompactionError::Storage(e),
                Error::Metastore(e) => CompactionError::Metastore(e),
                other => CompactionError::Merge(other.to_string()),
            })?;

        let marked: Vec<BlockId> = match job.kind {
            JobKind::Vertical | JobKind::Horizontal => job.sources.iter().map(|s| s.block_id).collect(),
            JobKind::Downsample => Vec::new(),
        };
        for source in job.sources.iter().filter(|s| marked.contains(&s.block_id)) {
            if let Err(e) = block::write_deletion_mark(self.bucket.as_ref(), source, now).await {
                self.cleanup(&written).await;
                return Err(e.into());
            }
            written.push(source.deletion_mark_key());
        }

        if let Err(e) = self.metastore.commit_compaction(vec![meta.clone()], &marked, now) {
            self.cleanup(&written).await;
            return Err(e.into());
        }
        Ok(meta)
    }

    /// Sources must all be known and active
    fn check_sources(&self, job: &CompactionJob) -> Result<(), CompactionError> {
        let minimum = match job.kind {
            JobKind::Vertical | JobKind::Horizontal => 2,
            JobKind::Downsample => 1,
        };
        if job.sources.len() < minimum {
            return Err(CompactionError::InvalidJob(format!(
                "{} job {} needs at least {} sources, got {}",
                job.kind,
                job.id,
                minimum,
                job.sources.len()
            )));
        }
        for source in &job.sources {
            match self.metastore.get(&source.block_id) {
                Some(meta) if meta.is_active() => {},
                _ => return Err(CompactionError::SourceUnavailable(source.block_id.to_string())),
            }
        }
        Ok(())
    }

    /// Combine sources of one resolution into a single deduplicated block
    fn merge(
        &self,
        job: &CompactionJob,
        payloads: Vec<(&BlockMeta, BlockPayload)>,
    ) -> Result<(BlockMeta, BlockPayload), CompactionError> {
        if job.sources.iter().any(|s| s.resolution != job.target_resolution) {
            return Err(CompactionError::InvalidJob(format!(
                "{} job {} mixes resolutions",
                job.kind, job.id
            )));
        }

        let dedup = DedupConfig {
            replica_labels: self.config.replica_labels.clone(),
            replica_preference: self.config.replica_preference.clone(),
            function: DedupFunction::Penalty,
            skew_tolerance_ms: 0,
        };

        let payload = if job.target_resolution == Resolution::Raw {
            let mut fragments = Vec::new();
            for (source, payload) in payloads {
                let replica = self.replica_of(source);
                let BlockPayload::Raw(series) = payload else {
                    return Err(CompactionError::Merge(format!("block {} is not raw", source.block_id)));
                };
                for s in series {
                    fragments.push(SeriesFragment::new(s.labels, s.points, replica.clone()));
                }
            }
            let (merged, stats) = merge_fragments(fragments, &dedup);
            debug!(
                job_id = job.id,
                input = stats.input_samples,
                output = stats.output_samples,
                "Raw series merged"
            );
            BlockPayload::Raw(
                merged
                    .into_iter()
                    .map(|s| BlockSeries::new(s.labels, s.samples))
                    .collect(),
            )
        } else {
            let mut sources = Vec::with_capacity(payloads.len());
            for (source, payload) in payloads {
                let BlockPayload::Aggregated(series) = payload else {
                    return Err(CompactionError::Merge(format!(
                        "block {} is not aggregated",
                        source.block_id
                    )));
                };
                sources.push(AggrSource {
                    identity: self.replica_of(source),
                    values: self
                        .config
                        .replica_labels
                        .iter()
                        .filter_map(|l| source.external_labels.get(l).map(str::to_string))
                        .collect(),
                    series,
                });
            }
            BlockPayload::Aggregated(merge_aggregated(
                sources,
                job.target_resolution.window_ms(),
                &self.config.replica_preference,
            ))
        };

        let external_labels = job
            .sources
            .iter()
            .skip(1)
            .fold(job.sources[0].external_labels.clone(), |acc, s| {
                acc.intersection(&s.external_labels)
            });
        let level = job.sources.iter().map(|s| s.compaction_level).max().unwrap_or(1) + 1;

        let mut meta = BlockMeta::new(
            Ulid::new(),
            job.min_time(),
            job.max_time(),
            job.target_resolution,
            external_labels,
        );
        meta.compaction_level = level;
        meta.source_block_ids = source_ids(job);
        Ok((meta, payload))
    }

    fn replica_of(&self, meta: &BlockMeta) -> String {
        let replica = meta.replica(&self.config.replica_labels);
        if replica.is_empty() {
            meta.block_id.to_string()
        } else {
            replica
        }
    }

    async fn cleanup(&self, keys: &[String]) {
        for key in keys.iter().rev() {
            if let Err(e) = self.bucket.delete(key).await {
                warn!(key = %key, error = %e, "Failed to remove partial compaction output");
            }
        }
    }
}

/// Build the coarser sibling of a single block
fn downsample(
    job: &CompactionJob,
    mut payloads: Vec<(&BlockMeta, BlockPayload)>,
) -> Result<(BlockMeta, BlockPayload), CompactionError> {
    let (source, payload) = payloads
        .pop()
        .ok_or_else(|| CompactionError::InvalidJob(format!("downsample job {} has no source", job.id)))?;
    if source.resolution.coarser() != Some(job.target_resolution) {
        return Err(CompactionError::InvalidJob(format!(
            "cannot downsample {} to {}",
            source.resolution, job.target_resolution
        )));
    }

    let window = job.target_resolution.window_ms();
    let series = match payload {
        BlockPayload::Raw(series) => downsample_raw(&series, window),
        BlockPayload::Aggregated(series) => downsample_aggregated(&series, window),
    };

    let mut meta = BlockMeta::new(
        Ulid::new(),
        source.min_time,
        source.max_time,
        job.target_resolution,
        source.external_labels.clone(),
    );
    meta.compaction_level = source.compaction_level;
    meta.source_block_ids = source_ids(job);
    Ok((meta, BlockPayload::Aggregated(series)))
}

fn source_ids(job: &CompactionJob) -> BTreeSet<BlockId> {
    job.sources.iter().map(|s| s.block_id).collect()
}

/// Aggregated series of one source block
struct AggrSource {
    identity: String,
    values: Vec<String>,
    series: Vec<BlockSeries<AggrSample>>,
}

/// Union of aggregated series, one point per window
///
/// Points are keyed by window index, not by timestamp: replicas stamp a
/// window with their own last sample time. Replicas are ranked the same way
/// query-time deduplication ranks them and the best one wins each window.
fn merge_aggregated(
    sources: Vec<AggrSource>,
    window_ms: i64,
    preference: &[String],
) -> Vec<BlockSeries<AggrSample>> {
    let window_ms = window_ms.max(1);
    let mut by_series: BTreeMap<Labels, BTreeMap<&str, (&[String], BTreeMap<i64, AggrSample>)>> = BTreeMap::new();
    for source in &sources {
        for s in &source.series {
            let (_, windows) = by_series
                .entry(s.labels.clone())
                .or_default()
                .entry(source.identity.as_str())
                .or_insert_with(|| (source.values.as_slice(), BTreeMap::new()));
            for p in &s.points {
                windows
                    .entry(p.timestamp.div_euclid(window_ms))
                    .and_modify(|existing| {
                        if (p.count, p.timestamp) > (existing.count, existing.timestamp) {
                            *existing = *p;
                        }
                    })
                    .or_insert(*p);
            }
        }
    }

    let mut out = Vec::with_capacity(by_series.len());
    for (labels, replicas) in by_series {
        let replicas: Vec<(&str, (&[String], BTreeMap<i64, AggrSample>))> = replicas.into_iter().collect();
        let timelines: Vec<ReplicaTimeline<'_>> = replicas
            .iter()
            .map(|(identity, (values, windows))| ReplicaTimeline {
                identity: *identity,
                values: *values,
                timestamps: windows.keys().map(|w| w * window_ms).collect(),
            })
            .collect();

        let mut merged: BTreeMap<i64, AggrSample> = BTreeMap::new();
        for i in replica_order(&timelines, preference) {
            let (_, (_, windows)) = &replicas[i];
            for (window, point) in windows {
                merged.entry(*window).or_insert(*point);
            }
        }
        out.push(BlockSeries::new(labels, merged.into_values().collect()));
    }
    out
}
