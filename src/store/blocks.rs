//! Block-backed provider
//!
//! Serves the series of one stored block, restricted to the sub-ranges the
//! query engine assigned to it.

use async_trait::async_trait;
use std::sync::Arc;

use super::{SeriesRequest, StoreClient};
use crate::block::{self, BlockMeta};
use crate::error::StoreError;
use crate::objstore::ObjectStore;
use crate::types::{matches_all, SeriesFragment, TimeRange};

/// Reads one block from the bucket
pub struct BlockSeriesClient {
    endpoint: String,
    bucket: Arc<dyn ObjectStore>,
    meta: BlockMeta,
    ranges: Vec<TimeRange>,
}

impl BlockSeriesClient {
    /// Serve the whole block
    pub fn new(bucket: Arc<dyn ObjectStore>, meta: BlockMeta) -> Self {
        let ranges = vec![meta.time_range()];
        Self::with_ranges(bucket, meta, ranges)
    }

    /// Serve only samples falling inside `ranges`
    pub fn with_ranges(bucket: Arc<dyn ObjectStore>, meta: BlockMeta, ranges: Vec<TimeRange>) -> Self {
        Self {
            endpoint: format!("block/{}/{}", meta.block_id, meta.resolution),
            bucket,
            meta,
            ranges,
        }
    }

    /// Served block
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }
}

#[async_trait]
impl StoreClient for BlockSeriesClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn series(&self, request: &SeriesRequest) -> Result<Vec<SeriesFragment>, StoreError> {
        let window = request.time_range();
        let ranges: Vec<TimeRange> = self
            .ranges
            .iter()
            .filter_map(|r| r.intersect(&window))
            .collect();
        if ranges.is_empty() {
            return Ok(Vec::new());
        }

        let payload = block::read_payload(self.bucket.as_ref(), &self.meta)
            .await
            .map_err(|e| StoreError::from_storage(&self.endpoint, &e))?;

        let mut out = Vec::new();
        for series in payload.into_samples(request.aggregate) {
            let labels = series.labels.merged(&self.meta.external_labels);
            if !matches_all(&request.matchers, &labels) {
                continue;
            }
            let samples: Vec<_> = series
                .points
                .into_iter()
                .filter(|s| ranges.iter().any(|r| r.contains(s.timestamp)))
                .collect();
            if samples.is_empty() {
                continue;
            }
            out.push(SeriesFragment::new(labels, samples, self.endpoint.clone()));
        }
        Ok(out)
    }
}
