//! Block compaction and downsampling
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  jobs   ┌─────────────┐  jobs  ┌──────────────┐
//! │   Planner    │────────▶│ work queue  │───────▶│   Workers    │
//! │ (per tick)   │         │ (bounded)   │        │  (Executor)  │
//! └──────────────┘         └─────────────┘        └──────┬───────┘
//!        ▲                                               │ results
//!        │            ┌─────────────────┐                │
//!        └────────────│ FailureTracker  │◀───────────────┘
//!                     └─────────────────┘
//! ```
//!
//! - **Planner**: groups active blocks and emits at most one job per group
//!   (vertical before horizontal before downsample)
//! - **Executor**: runs a job all-or-nothing: writes the new block, marks the
//!   sources and commits both to the metadata store in one step
//! - **CompactionService**: the periodic loop tying both together, purging
//!   expired blocks and halting groups that keep failing

pub mod downsample;
pub mod executor;
pub mod planner;
pub mod service;

pub use executor::Executor;
pub use planner::{CompactionJob, JobKind, Planner};
pub use service::{CompactionService, CompactionStats, CycleReport, FailureTracker};

use std::time::Duration;

/// Compaction settings
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Time between planning passes
    /// Default: 5 minutes
    pub interval: Duration,

    /// Minimum age of a block's `max_time` before it may be compacted
    /// Default: 30 minutes
    pub consistency_delay: Duration,

    /// Time a block stays marked before it is purged
    /// Default: 48 hours
    pub delete_delay: Duration,

    /// Aligned windows horizontal compaction merges into, smallest first
    /// Default: 2h, 8h, 2d, 14d
    pub block_ranges: Vec<Duration>,

    /// Produce 5m and 1h siblings of old blocks
    /// Default: true
    pub downsampling_enabled: bool,

    /// Minimum age of a raw block before it gets a 5m sibling
    /// Default: 40 hours
    pub downsample_raw_after: Duration,

    /// Minimum age of a 5m block before it gets a 1h sibling
    /// Default: 10 days
    pub downsample_5m_after: Duration,

    /// Consecutive failures after which a group is halted
    /// Default: 3
    pub max_consecutive_failures: u32,

    /// Jobs executed at once across all groups
    /// Default: 2
    pub max_concurrent_jobs: usize,

    /// Capacity of the work queue between planner and workers
    /// Default: 100
    pub queue_capacity: usize,

    /// Labels identifying a replica
    pub replica_labels: Vec<String>,

    /// Preferred replicas for vertical merges, best first
    pub replica_preference: Vec<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            consistency_delay: Duration::from_secs(30 * 60),
            delete_delay: Duration::from_secs(48 * 3600),
            block_ranges: vec![
                Duration::from_secs(2 * 3600),
                Duration::from_secs(8 * 3600),
                Duration::from_secs(2 * 24 * 3600),
                Duration::from_secs(14 * 24 * 3600),
            ],
            downsampling_enabled: true,
            downsample_raw_after: Duration::from_secs(40 * 3600),
            downsample_5m_after: Duration::from_secs(10 * 24 * 3600),
            max_consecutive_failures: 3,
            max_concurrent_jobs: 2,
            queue_capacity: 100,
            replica_labels: vec!["replica".to_string(), "prometheus_replica".to_string()],
            replica_preference: Vec::new(),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
