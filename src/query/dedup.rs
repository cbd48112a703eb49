//! Replica deduplication
//!
//! Highly available setups run several identical replicas that scrape the
//! same targets. Their series differ only in the replica labels. Merging
//! strips those labels and keeps one sample per point in time.
//!
//! # Functions
//!
//! - **penalty**: replicas are ranked (configured preference, then fewest
//!   gaps, then name). For every distinct timestamp the sample of the best
//!   ranked replica that has one is kept, so gaps in one replica are filled
//!   from another.
//! - **latest**: samples closer together than the skew tolerance are treated
//!   as the same point; the one with the most recent timestamp is kept.
//!
//! Output is independent of fragment arrival order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::result::Series;
use crate::types::{Labels, Sample, SeriesFragment};

/// Sample selection rule among replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupFunction {
    /// Best-ranked replica wins per timestamp
    #[default]
    Penalty,
    /// Most recent sample wins within the skew tolerance
    Latest,
}

impl fmt::Display for DedupFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DedupFunction::Penalty => "penalty",
            DedupFunction::Latest => "latest",
        })
    }
}

impl FromStr for DedupFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "penalty" => Ok(DedupFunction::Penalty),
            "latest" => Ok(DedupFunction::Latest),
            other => Err(format!("Unknown dedup function '{}'", other)),
        }
    }
}

/// Deduplication settings
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Labels identifying a replica; stripped from output
    pub replica_labels: Vec<String>,
    /// Preferred replicas, best first
    ///
    /// Entries match a replica identity (`replica=0`) or the bare value of a
    /// replica label (`0`).
    pub replica_preference: Vec<String>,
    /// Selection rule
    pub function: DedupFunction,
    /// Maximum timestamp distance treated as the same point by `latest` (ms)
    pub skew_tolerance_ms: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            replica_labels: vec!["replica".to_string(), "prometheus_replica".to_string()],
            replica_preference: Vec::new(),
            function: DedupFunction::Penalty,
            skew_tolerance_ms: 0,
        }
    }
}

/// Counters of one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Samples received
    pub input_samples: usize,
    /// Samples returned
    pub output_samples: usize,
}

impl DedupStats {
    /// Samples discarded as replica duplicates
    pub fn dropped(&self) -> usize {
        self.input_samples.saturating_sub(self.output_samples)
    }
}

/// Samples of one replica of one series
struct ReplicaSamples {
    identity: String,
    values: Vec<String>,
    samples: Vec<Sample>,
}

/// Merge fragments into one series per deduplicated label set
///
/// Output is ordered by labels; samples are ordered by timestamp with at
/// most one sample per timestamp.
pub fn merge_fragments(fragments: Vec<SeriesFragment>, config: &DedupConfig) -> (Vec<Series>, DedupStats) {
    let mut stats = DedupStats::default();
    let mut groups: BTreeMap<Labels, BTreeMap<String, ReplicaSamples>> = BTreeMap::new();

    for fragment in fragments {
        stats.input_samples += fragment.samples.len();
        let identity = replica_key(&fragment, &config.replica_labels);
        let values: Vec<String> = config
            .replica_labels
            .iter()
            .filter_map(|name| fragment.labels.get(name).map(str::to_string))
            .collect();
        let key = fragment.labels.without(&config.replica_labels);

        groups
            .entry(key)
            .or_default()
            .entry(identity.clone())
            .or_insert_with(|| ReplicaSamples {
                identity,
                values,
                samples: Vec::new(),
            })
            .samples
            .extend(fragment.samples);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (labels, replicas) in groups {
        let mut replicas: Vec<ReplicaSamples> = replicas.into_values().collect();
        for r in &mut replicas {
            normalize(&mut r.samples);
        }
        let samples = if replicas.len() == 1 {
            replicas.pop().map(|r| r.samples).unwrap_or_default()
        } else {
            rank_replicas(&mut replicas, &config.replica_preference);
            match config.function {
                DedupFunction::Penalty => select_penalty(&replicas),
                DedupFunction::Latest => select_latest(&replicas, config.skew_tolerance_ms),
            }
        };
        stats.output_samples += samples.len();
        if !samples.is_empty() {
            out.push(Series { labels, samples });
        }
    }
    (out, stats)
}

/// Replica identity of a fragment
///
/// Falls back to the fragment's source when it carries no replica labels.
fn replica_key(fragment: &SeriesFragment, replica_labels: &[String]) -> String {
    let identity = fragment.labels.replica_identity(replica_labels);
    if identity.is_empty() {
        fragment.source_replica.clone()
    } else {
        identity
    }
}

/// Sort by timestamp and keep one sample per timestamp
fn normalize(samples: &mut Vec<Sample>) {
    samples.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.value.total_cmp(&b.value))
    });
    samples.dedup_by_key(|s| s.timestamp);
}

/// Timestamps of one replica, as seen by the ranking
pub(crate) struct ReplicaTimeline<'a> {
    /// Replica identity (`replica=0`)
    pub identity: &'a str,
    /// Bare replica label values
    pub values: &'a [String],
    /// Sorted, distinct timestamps
    pub timestamps: Vec<i64>,
}

/// Expected scrape interval: median of positive deltas across replicas
fn expected_interval(timelines: &[ReplicaTimeline<'_>]) -> Option<i64> {
    let mut deltas: Vec<i64> = timelines
        .iter()
        .flat_map(|t| t.timestamps.windows(2).map(|w| w[1] - w[0]))
        .filter(|d| *d > 0)
        .collect();
    if deltas.is_empty() {
        return None;
    }
    deltas.sort_unstable();
    Some(deltas[deltas.len() / 2])
}

fn missing_intervals(span: i64, interval: i64) -> usize {
    ((span as f64 / interval as f64).round() as i64 - 1).max(0) as usize
}

/// Number of expected timestamps a replica lacks inside `[start, end]`
fn gap_count(timestamps: &[i64], start: i64, end: i64, interval: i64) -> usize {
    let (Some(first), Some(last)) = (timestamps.first(), timestamps.last()) else {
        return usize::MAX;
    };
    let leading = missing_intervals(first - start + interval, interval);
    let trailing = missing_intervals(end - last + interval, interval);
    let inner: usize = timestamps
        .windows(2)
        .map(|w| missing_intervals(w[1] - w[0], interval))
        .sum();
    leading + inner + trailing
}

fn preference_rank(timeline: &ReplicaTimeline<'_>, preference: &[String]) -> usize {
    preference
        .iter()
        .position(|p| p == timeline.identity || timeline.values.iter().any(|v| v == p))
        .unwrap_or(usize::MAX)
}

/// Indices of `timelines`, best replica first
///
/// Configured preference position, then fewest gaps over the union window,
/// then replica name. Shared by query-time merges and vertical compaction so
/// both pick the same replica.
pub(crate) fn replica_order(timelines: &[ReplicaTimeline<'_>], preference: &[String]) -> Vec<usize> {
    let start = timelines
        .iter()
        .filter_map(|t| t.timestamps.first().copied())
        .min()
        .unwrap_or(0);
    let end = timelines
        .iter()
        .filter_map(|t| t.timestamps.last().copied())
        .max()
        .unwrap_or(0);
    let interval = expected_interval(timelines);

    let mut keyed: Vec<(usize, usize, usize)> = timelines
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let gaps = interval.map_or(0, |iv| gap_count(&t.timestamps, start, end, iv));
            (preference_rank(t, preference), gaps, i)
        })
        .collect();
    keyed.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then_with(|| timelines[a.2].identity.cmp(timelines[b.2].identity))
    });
    keyed.into_iter().map(|(_, _, i)| i).collect()
}

/// Order replicas best first
fn rank_replicas(replicas: &mut [ReplicaSamples], preference: &[String]) {
    let order = {
        let timelines: Vec<ReplicaTimeline<'_>> = replicas
            .iter()
            .map(|r| ReplicaTimeline {
                identity: &r.identity,
                values: &r.values,
                timestamps: r.samples.iter().map(|s| s.timestamp).collect(),
            })
            .collect();
        replica_order(&timelines, preference)
    };
    apply_order(replicas, &order);
}

fn apply_order(replicas: &mut [ReplicaSamples], order: &[usize]) {
    // position[i] = where the replica currently at i must go
    let mut position = vec![0; order.len()];
    for (dst, src) in order.iter().enumerate() {
        position[*src] = dst;
    }
    for i in 0..replicas.len() {
        while position[i] != i {
            let j = position[i];
            replicas.swap(i, j);
            position.swap(i, j);
        }
    }
}

/// Union of timestamps, best ranked replica wins each one
fn select_penalty(ranked: &[ReplicaSamples]) -> Vec<Sample> {
    let mut merged: BTreeMap<i64, f64> = BTreeMap::new();
    for replica in ranked {
        for s in &replica.samples {
            merged.entry(s.timestamp).or_insert(s.value);
        }
    }
    merged.into_iter().map(|(t, v)| Sample::new(t, v)).collect()
}

/// Cluster samples within the skew tolerance, keep the most recent per cluster
fn select_latest(ranked: &[ReplicaSamples], skew_tolerance_ms: i64) -> Vec<Sample> {
    let mut all: Vec<(Sample, usize)> = ranked
        .iter()
        .enumerate()
        .flat_map(|(rank, r)| r.samples.iter().map(move |s| (*s, rank)))
        .collect();
    all.sort_by(|a, b| {
        a.0.timestamp
            .cmp(&b.0.timestamp)
            .then(a.1.cmp(&b.1))
            .then_with(|| a.0.value.total_cmp(&b.0.value))
    });

    let mut out: Vec<Sample> = Vec::new();
    let mut cluster_start: Option<i64> = None;
    let mut best: Option<(Sample, usize)> = None;
    for (sample, rank) in all {
        match cluster_start {
            Some(start) if sample.timestamp - start <= skew_tolerance_ms => {
                if let Some((b, b_rank)) = best {
                    let newer = match sample.timestamp.cmp(&b.timestamp) {
                        Ordering::Greater => true,
                        Ordering::Equal => rank < b_rank,
                        Ordering::Less => false,
                    };
                    if newer {
                        best = Some((sample, rank));
                    }
                }
            },
            _ => {
                if let Some((b, _)) = best.take() {
                    out.push(b);
                }
                cluster_start = Some(sample.timestamp);
                best = Some((sample, rank));
            },
        }
    }
    if let Some((b, _)) = best {
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(replica: &str, ts: &[i64], value: f64) -> SeriesFragment {
        SeriesFragment::new(
            Labels::from_pairs([("__name__", "up"), ("replica", replica)]),
            ts.iter().map(|t| Sample::new(*t, value)).collect(),
            format!("sidecar-{}", replica),
        )
    }

    fn timestamps(series: &Series) -> Vec<i64> {
        series.samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_penalty_fills_gaps_from_other_replica() {
        let a = fragment("0", &[0, 15, 30, 45, 60], 1.0);
        let b = fragment("1", &[0, 15, 45, 60], 2.0);

        let (series, stats) = merge_fragments(vec![b, a], &DedupConfig::default());
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels, Labels::from_pairs([("__name__", "up")]));
        assert_eq!(timestamps(&series[0]), vec![0, 15, 30, 45, 60]);
        // replica 0 has no gaps and wins every timestamp
        assert!(series[0].samples.iter().all(|s| s.value == 1.0));
        assert_eq!(stats.dropped(), 4);
    }

    #[test]
    fn test_preference_order_beats_gap_count() {
        let a = fragment("0", &[0, 15, 30], 1.0);
        let b = fragment("1", &[0, 30], 2.0);
        let config = DedupConfig {
            replica_preference: vec!["1".to_string()],
            ..Default::default()
        };
        let (series, _) = merge_fragments(vec![a, b], &config);
        assert_eq!(
            series[0].samples,
            vec![Sample::new(0, 2.0), Sample::new(15, 1.0), Sample::new(30, 2.0)]
        );
    }

    #[test]
    fn test_trailing_gap_counts() {
        // replica 1 stops early; replica 0 covers the whole window
        let a = fragment("1", &[0, 10, 20, 30, 40], 1.0);
        let b = fragment("0", &[0, 10, 20], 2.0);
        let (series, _) = merge_fragments(vec![b, a], &DedupConfig::default());
        assert!(series[0].samples.iter().all(|s| s.value == 1.0));
    }

    #[test]
    fn test_ties_broken_by_replica_name() {
        let a = fragment("b", &[0, 10], 1.0);
        let b = fragment("a", &[0, 10], 2.0);
        let (series, _) = merge_fragments(vec![a, b], &DedupConfig::default());
        assert!(series[0].samples.iter().all(|s| s.value == 2.0));
    }

    #[test]
    fn test_latest_within_skew() {
        let a = fragment("0", &[1_000, 16_000], 1.0);
        let b = fragment("1", &[1_200, 15_900], 2.0);
        let config = DedupConfig {
            function: DedupFunction::Latest,
            skew_tolerance_ms: 500,
            ..Default::default()
        };
        let (series, _) = merge_fragments(vec![a, b], &config);
        assert_eq!(
            series[0].samples,
            vec![Sample::new(1_200, 2.0), Sample::new(16_000, 1.0)]
        );
    }

    #[test]
    fn test_distinct_series_kept_apart() {
        let a = fragment("0", &[0], 1.0);
        let other = SeriesFragment::new(
            Labels::from_pairs([("__name__", "down"), ("replica", "0")]),
            vec![Sample::new(0, 3.0)],
            "sidecar-0",
        );
        let (series, _) = merge_fragments(vec![other, a], &DedupConfig::default());
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].labels.get("__name__"), Some("down"));
    }

    #[test]
    fn test_fragments_without_replica_labels_use_source() {
        let labels = Labels::from_pairs([("__name__", "up")]);
        let a = SeriesFragment::new(labels.clone(), vec![Sample::new(0, 1.0)], "block/A");
        let b = SeriesFragment::new(labels, vec![Sample::new(0, 2.0), Sample::new(10, 2.0)], "block/B");
        let (series, _) = merge_fragments(vec![a, b], &DedupConfig::default());
        assert_eq!(timestamps(&series[0]), vec![0, 10]);
    }

    #[test]
    fn test_apply_order() {
        let mut replicas: Vec<ReplicaSamples> = ["a", "b", "c"]
            .iter()
            .map(|id| ReplicaSamples {
                identity: id.to_string(),
                values: Vec::new(),
                samples: Vec::new(),
            })
            .collect();
        apply_order(&mut replicas, &[2, 0, 1]);
        let ids: Vec<&str> = replicas.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_replica_order_on_window_grid() {
        let sparse = vec!["replica=0".to_string()];
        let full = vec!["replica=1".to_string()];
        let timelines = vec![
            ReplicaTimeline {
                identity: &sparse[0],
                values: &[],
                timestamps: vec![0, 300_000],
            },
            ReplicaTimeline {
                identity: &full[0],
                values: &[],
                timestamps: (0..12).map(|w| w * 300_000).collect(),
            },
        ];
        assert_eq!(replica_order(&timelines, &[]), vec![1, 0]);
        assert_eq!(replica_order(&timelines, &["replica=0".to_string()]), vec![0, 1]);
    }
}
