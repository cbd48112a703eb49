//! In-memory provider
//!
//! Holds recent samples the way a live ingestion sidecar does and serves them
//! under its external labels.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{ProviderInfo, SeriesRequest, StoreClient};
use crate::error::StoreError;
use crate::types::{matches_all, Labels, Resolution, Sample, SeriesFragment, TimeRange};

/// Live provider backed by an in-memory series map
pub struct InMemoryStoreClient {
    endpoint: String,
    external_labels: Labels,
    series: RwLock<BTreeMap<Labels, Vec<Sample>>>,
}

impl InMemoryStoreClient {
    /// Create an empty provider
    pub fn new(endpoint: impl Into<String>, external_labels: Labels) -> Self {
        Self {
            endpoint: endpoint.into(),
            external_labels,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    /// Append samples to a series, keeping them ordered by timestamp
    ///
    /// A sample at an existing timestamp replaces the stored one.
    pub fn append(&self, labels: Labels, samples: impl IntoIterator<Item = Sample>) {
        let mut series = self.series.write();
        let stored = series.entry(labels).or_default();
        for sample in samples {
            match stored.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
                Ok(i) => stored[i] = sample,
                Err(i) => stored.insert(i, sample),
            }
        }
    }

    /// External labels attached to every served series
    pub fn external_labels(&self) -> &Labels {
        &self.external_labels
    }

    /// Advertised metadata; the time range spans the stored samples
    pub fn info(&self) -> ProviderInfo {
        let series = self.series.read();
        let bounds = series
            .values()
            .filter_map(|s| Some((s.first()?.timestamp, s.last()?.timestamp)))
            .fold(None, |acc: Option<(i64, i64)>, (lo, hi)| match acc {
                None => Some((lo, hi)),
                Some((a, b)) => Some((a.min(lo), b.max(hi))),
            });
        let (min_time, max_time) = bounds.unwrap_or((0, 0));
        ProviderInfo {
            endpoint: self.endpoint.clone(),
            label_sets: vec![self.external_labels.clone()],
            time_range: TimeRange { min_time, max_time },
            min_resolution: Resolution::Raw,
        }
    }
}

#[async_trait]
impl StoreClient for InMemoryStoreClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn series(&self, request: &SeriesRequest) -> Result<Vec<SeriesFragment>, StoreError> {
        let range = request.time_range();
        let series = self.series.read();
        let mut out = Vec::new();
        for (labels, samples) in series.iter() {
            let full = labels.merged(&self.external_labels);
            if !matches_all(&request.matchers, &full) {
                continue;
            }
            let window: Vec<Sample> = samples
                .iter()
                .filter(|s| range.contains(s.timestamp))
                .copied()
                .collect();
            if window.is_empty() {
                continue;
            }
            out.push(SeriesFragment::new(full, window, self.endpoint.clone()));
        }
        Ok(out)
    }
}
