//! Query federation for replicated, multi-resolution block storage
//!
//! Answers label-matcher + time-range queries by reading compacted blocks
//! from object storage and live data from providers, then merging the
//! replica copies into one series per logical label set.
//!
//! # Architecture
//!
//! ```text
//! SeriesQuery
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Resolution  │  raw / raw+5m / 5m+1h by range length
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Candidates │  MetaStore::list_overlapping + StorePool::select_providers
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Fan-out   │  bounded by max_concurrent_select, per-provider timeout
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Merge/Dedup │  penalty or latest
//! └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use panorama_tsdb::query::{QueryConfig, QueryEngine};
//! use panorama_tsdb::types::{LabelMatcher, SeriesQuery};
//!
//! let engine = QueryEngine::new(QueryConfig::default(), metastore, bucket, pool);
//! let query = SeriesQuery::new(start, end).with_matcher(LabelMatcher::equal("job", "api"));
//! let response = engine.query(&query).await?;
//! for series in &response.series {
//!     println!("{} → {} samples", series.labels, series.samples.len());
//! }
//! ```

pub mod dedup;
pub mod engine;
pub mod error;
pub mod resolution;
pub mod result;

pub use dedup::{merge_fragments, DedupConfig, DedupFunction, DedupStats};
pub use engine::{QueryConfig, QueryEngine};
pub use error::{QueryError, QueryErrorKind, QueryResult};
pub use resolution::{select_resolutions, ResolutionThresholds};
pub use result::{QueryResponse, QueryStats, Series};
