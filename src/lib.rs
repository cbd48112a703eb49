//! Panorama TSDB - global query federation and block compaction
//!
//! This library provides the core of a long-term store for Prometheus-format
//! time-series kept as immutable blocks in object storage:
//! - Query federation across blocks and live providers with bounded fan-out
//! - Replica deduplication (penalty and latest functions)
//! - Resolution-aware block selection over raw, 5m and 1h data
//! - Vertical and horizontal compaction plus downsampling, all-or-nothing
//!
//! # Example
//!
//! ```rust,ignore
//! use panorama_tsdb::{block, metastore::MetaStore, objstore::InMemoryObjectStore};
//!
//! let bucket = InMemoryObjectStore::new();
//! let metastore = MetaStore::new();
//! block::upload_block(&bucket, &metastore, meta, &payload).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod error;
pub mod metastore;
pub mod objstore;
pub mod retry;
pub mod store;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Query federation engine with replica deduplication
/// Selects resolutions and blocks, fans out to providers and merges results
pub mod query;

/// Compaction planning, execution and downsampling
/// Runs as a background service with per-group failure tracking
pub mod compact;

/// Background services with lifecycle management and graceful shutdown
pub mod services;

// Re-export main types
pub use block::{BlockId, BlockMeta};
pub use error::{Error, Result};
pub use metastore::MetaStore;
pub use query::{QueryConfig, QueryEngine, QueryResponse};
pub use types::{LabelMatcher, Labels, Resolution, Sample, SeriesQuery, TimeRange};
