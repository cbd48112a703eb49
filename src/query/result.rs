//! Query result types

use crate::types::{Labels, Resolution, Sample};

/// One deduplicated series
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Labels with replica labels stripped
    pub labels: Labels,
    /// Samples ordered by timestamp, one per timestamp
    pub samples: Vec<Sample>,
}

/// Execution statistics of one query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStats {
    /// Tiers the query read, finest first
    pub resolutions: Vec<Resolution>,
    /// Blocks read through the bucket
    pub blocks_queried: usize,
    /// Live providers called
    pub providers_queried: usize,
    /// Calls that failed after retries
    pub providers_failed: usize,
    /// Fragments received before merging
    pub fragments: usize,
    /// Samples received before deduplication
    pub samples_before_dedup: usize,
    /// Samples returned
    pub samples_after_dedup: usize,
}

/// Merged, deduplicated answer to a series query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    /// Series ordered by labels
    pub series: Vec<Series>,
    /// Provider failures tolerated under the partial response policy
    pub warnings: Vec<String>,
    /// Execution statistics
    pub stats: QueryStats,
}

impl QueryResponse {
    /// Whether some providers failed and the result may be incomplete
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Look up a series by its deduplicated labels
    pub fn find(&self, labels: &Labels) -> Option<&Series> {
        self.series.iter().find(|s| &s.labels == labels)
    }
}
