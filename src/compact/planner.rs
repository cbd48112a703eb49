//! Compaction planning
//!
//! Scans active blocks and decides what to merge next. Per compaction group
//! at most one job is emitted per pass, chosen in this order:
//!
//! 1. **vertical**: a cluster of two or more overlapping blocks at the same
//!    resolution (replica copies of the same range)
//! 2. **horizontal**: a run of two or more contiguous blocks inside one
//!    aligned window of a configured block range
//! 3. **downsample**: an old block without a coarser sibling

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::{duration_ms, CompactionConfig};
use crate::block::{BlockMeta, GroupKey};
use crate::types::Resolution;

// ============================================================================
// Compaction Job
// ============================================================================

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    /// Deduplicate overlapping replica blocks
    Vertical,
    /// Merge adjacent blocks into a larger one
    Horizontal,
    /// Produce a coarser sibling
    Downsample,
}

impl JobKind {
    /// Name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Vertical => "vertical",
            JobKind::Horizontal => "horizontal",
            JobKind::Downsample => "downsample",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of compaction work for one group
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Unique job ID
    pub id: u64,
    /// Work kind
    pub kind: JobKind,
    /// Group all sources belong to
    pub group: GroupKey,
    /// Source blocks, ordered by `min_time`
    pub sources: Vec<BlockMeta>,
    /// Resolution of the output block
    pub target_resolution: Resolution,
}

impl CompactionJob {
    /// Create a new compaction job
    pub fn new(kind: JobKind, group: GroupKey, mut sources: Vec<BlockMeta>, target_resolution: Resolution) -> Self {
        static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

        sources.sort_by(|a, b| a.min_time.cmp(&b.min_time).then(a.block_id.cmp(&b.block_id)));
        Self {
            id: JOB_COUNTER.fetch_add(1, Ordering::SeqCst),
            kind,
            group,
            sources,
            target_resolution,
        }
    }

    /// Earliest source `min_time`
    pub fn min_time(&self) -> i64 {
        self.sources.iter().map(|s| s.min_time).min().unwrap_or(0)
    }

    /// Latest source `max_time`
    pub fn max_time(&self) -> i64 {
        self.sources.iter().map(|s| s.max_time).max().unwrap_or(0)
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Produces compaction jobs from a snapshot of blocks
#[derive(Debug, Clone)]
pub struct Planner {
    config: CompactionConfig,
}

impl Planner {
    /// Create a planner
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Plan jobs for the given blocks at time `now` (ms)
    ///
    /// Marked blocks are ignored. Groups in `skip` (halted or already busy)
    /// get no job. Jobs are ordered vertical, horizontal, downsample and then
    /// by group.
    pub fn plan(&self, blocks: &[BlockMeta], now: i64, skip: &HashSet<GroupKey>) -> Vec<CompactionJob> {
        let mut groups: BTreeMap<GroupKey, Vec<&BlockMeta>> = BTreeMap::new();
        for meta in blocks.iter().filter(|m| m.is_active()) {
            groups
                .entry(meta.group_key(&self.config.replica_labels))
                .or_default()
                .push(meta);
        }

        let settled_before = now.saturating_sub(duration_ms(self.config.consistency_delay));
        let mut jobs = Vec::new();

        for (group, members) in groups {
            if skip.contains(&group) {
                debug!(group = %group, "Skipping group: halted or busy");
                continue;
            }
            let mut eligible: Vec<&BlockMeta> = members
                .iter()
                .copied()
                .filter(|m| m.max_time <= settled_before)
                .collect();
            eligible.sort_by(|a, b| a.min_time.cmp(&b.min_time).then(a.block_id.cmp(&b.block_id)));

            let job = self
                .vertical(&group, &eligible)
                .or_else(|| self.horizontal(&group, &eligible))
                .or_else(|| self.downsample(&group, &eligible, &members, now));
            if let Some(job) = job {
                debug!(
                    group = %group,
                    kind = %job.kind,
                    sources = job.sources.len(),
                    "Compaction job planned"
                );
                jobs.push(job);
            }
        }

        jobs.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.group.cmp(&b.group)));
        jobs
    }

    /// First cluster of transitively overlapping blocks, finest tier first
    fn vertical(&self, group: &GroupKey, eligible: &[&BlockMeta]) -> Option<CompactionJob> {
        for tier in Resolution::ALL {
            let tiered: Vec<&BlockMeta> = eligible.iter().copied().filter(|m| m.resolution == tier).collect();
            let mut cluster: Vec<&BlockMeta> = Vec::new();
            let mut cluster_max = i64::MIN;

            for meta in tiered {
                if !cluster.is_empty() && meta.min_time > cluster_max {
                    if cluster.len() >= 2 {
                        break;
                    }
                    cluster.clear();
                }
                cluster_max = if cluster.is_empty() {
                    meta.max_time
                } else {
                    cluster_max.max(meta.max_time)
                };
                cluster.push(meta);
            }

            if cluster.len() >= 2 {
                let sources = cluster.into_iter().cloned().collect();
                return Some(CompactionJob::new(JobKind::Vertical, group.clone(), sources, tier));
            }
        }
        None
    }

    /// First run of contiguous blocks inside an aligned window
    fn horizontal(&self, group: &GroupKey, eligible: &[&BlockMeta]) -> Option<CompactionJob> {
        for tier in Resolution::ALL {
            let tiered: Vec<&BlockMeta> = eligible.iter().copied().filter(|m| m.resolution == tier).collect();
            if tiered.len() < 2 {
                continue;
            }
            for range in &self.config.block_ranges {
                let range_ms = duration_ms(*range);
                if range_ms <= 0 {
                    continue;
                }

                let mut windows: BTreeMap<i64, Vec<&BlockMeta>> = BTreeMap::new();
                for meta in &tiered {
                    let start = meta.min_time.div_euclid(range_ms) * range_ms;
                    if meta.max_time < start + range_ms {
                        windows.entry(start).or_default().push(meta);
                    }
                }

                for members in windows.values() {
                    if let Some(run) = contiguous_run(members) {
                        let sources = run.into_iter().cloned().collect();
                        return Some(CompactionJob::new(JobKind::Horizontal, group.clone(), sources, tier));
                    }
                }
            }
        }
        None
    }

    /// First block old enough for a coarser sibling that has none yet
    fn downsample(
        &self,
        group: &GroupKey,
        eligible: &[&BlockMeta],
        members: &[&BlockMeta],
        now: i64,
    ) -> Option<CompactionJob> {
        if !self.config.downsampling_enabled {
            return None;
        }
        for meta in eligible {
            let (target, min_age) = match meta.resolution {
                Resolution::Raw => (Resolution::FiveMinutes, self.config.downsample_raw_after),
                Resolution::FiveMinutes => (Resolution::OneHour, self.config.downsample_5m_after),
                Resolution::OneHour => continue,
            };
            if now.saturating_sub(meta.max_time) < duration_ms(min_age) {
                continue;
            }
            let covered = members
                .iter()
                .any(|m| m.resolution == target && m.time_range().covers(&meta.time_range()));
            if covered {
                continue;
            }
            return Some(CompactionJob::new(
                JobKind::Downsample,
                group.clone(),
                vec![(*meta).clone()],
                target,
            ));
        }
        None
    }
}

/// First run of at least two blocks each starting right after the previous
fn contiguous_run<'a>(members: &[&'a BlockMeta]) -> Option<Vec<&'a BlockMeta>> {
    let mut run: Vec<&BlockMeta> = Vec::new();
    for meta in members {
        match run.last() {
            Some(prev) if prev.time_range().is_followed_by(&meta.time_range()) => run.push(meta),
            _ => {
                if run.len() >= 2 {
                    return Some(run);
                }
                run = vec![meta];
            },
        }
    }
    (run.len() >= 2).then_some(run)
}
