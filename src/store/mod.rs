//! StoreAPI Client Pool
//!
//! Providers are data sources that answer `Series` calls: live ingestion
//! sources holding recent data and readers of compacted blocks. The pool keeps
//! the set of known providers, selects the ones relevant to a query and fans a
//! request out to them concurrently.
//!
//! # Architecture
//!
//! ```text
//!                      ┌─────────────┐
//!   SeriesQuery ──────▶│  StorePool  │── select_providers()
//!                      └──────┬──────┘
//!                   fan_out() │  semaphore (max_concurrent_select)
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!      InMemoryStoreClient  BlockSeriesClient  ...  (StoreClient)
//! ```

mod blocks;
mod memory;
mod pool;

pub use blocks::BlockSeriesClient;
pub use memory::InMemoryStoreClient;
pub use pool::{FanOutResult, FanOutTarget, StorePool, StorePoolConfig};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Aggr, LabelMatcher, Labels, Resolution, SeriesFragment, SeriesQuery, TimeRange};

/// Request sent to a single provider
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    /// Selector terms, all must match
    pub matchers: Vec<LabelMatcher>,
    /// Start of the window (inclusive, ms)
    pub min_time: i64,
    /// End of the window (inclusive, ms)
    pub max_time: i64,
    /// Aggregate to read from downsampled data
    pub aggregate: Aggr,
}

impl SeriesRequest {
    /// Request covering a whole query
    pub fn from_query(query: &SeriesQuery) -> Self {
        Self {
            matchers: query.matchers.clone(),
            min_time: query.min_time,
            max_time: query.max_time,
            aggregate: query.aggregate,
        }
    }

    /// Requested window
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }
}

/// A data provider answering series requests
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Provider address, used in logs, metrics and warnings
    fn endpoint(&self) -> &str;

    /// Return every matching series with samples inside the request window
    async fn series(&self, request: &SeriesRequest) -> Result<Vec<SeriesFragment>, StoreError>;
}

/// What a provider advertises about the data it holds
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInfo {
    /// Provider address
    pub endpoint: String,
    /// External label sets of the data; empty = unknown, matches anything
    pub label_sets: Vec<Labels>,
    /// Time range the provider can serve
    pub time_range: TimeRange,
    /// Finest resolution the provider can serve
    pub min_resolution: Resolution,
}

impl ProviderInfo {
    /// Whether any advertised label set could satisfy the matchers
    ///
    /// Only matchers on labels present in an advertised set are checked;
    /// other labels live on the series and cannot be ruled out up front.
    pub fn matches_labels(&self, matchers: &[LabelMatcher]) -> bool {
        if self.label_sets.is_empty() {
            return true;
        }
        self.label_sets.iter().any(|set| {
            matchers
                .iter()
                .filter(|m| set.contains(&m.name))
                .all(|m| m.matches(set))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchOp;

    fn info(label_sets: Vec<Labels>) -> ProviderInfo {
        ProviderInfo {
            endpoint: "sidecar-0".into(),
            label_sets,
            time_range: TimeRange::new(0, 100).unwrap(),
            min_resolution: Resolution::Raw,
        }
    }

    #[test]
    fn test_label_set_compatibility() {
        let eu = info(vec![Labels::from_pairs([("cluster", "eu")])]);

        assert!(eu.matches_labels(&[LabelMatcher::equal("cluster", "eu")]));
        assert!(!eu.matches_labels(&[LabelMatcher::equal("cluster", "us")]));
        // label not advertised: cannot be ruled out
        assert!(eu.matches_labels(&[LabelMatcher::equal("job", "api")]));
        assert!(eu.matches_labels(&[LabelMatcher::new(MatchOp::RegexMatch, "cluster", "e.*").unwrap()]));

        assert!(info(Vec::new()).matches_labels(&[LabelMatcher::equal("cluster", "us")]));
    }
}
