//! Core data types shared across the federation and compaction layers
//!
//! # Key Types
//!
//! - **`Labels`**: ordered label set (name → value) with unique names
//! - **`TimeRange`**: inclusive `[min_time, max_time]` window in milliseconds
//! - **`Resolution`**: downsampling tier (`raw`, `5m`, `1h`)
//! - **`LabelMatcher`**: one `name op value` selector term
//! - **`SeriesQuery`**: matchers + time range + resolution hints
//! - **`SeriesFragment`**: one provider's samples for one series, pre-dedup
//!
//! # Example
//!
//! ```rust
//! use panorama_tsdb::types::{Labels, TimeRange};
//!
//! let labels = Labels::from_pairs([("cluster", "eu1"), ("replica", "0")]);
//! let group = labels.without(&["replica".to_string()]);
//! assert_eq!(group.to_string(), r#"{cluster="eu1"}"#);
//!
//! let range = TimeRange::new(0, 7_200_000).unwrap();
//! assert!(range.contains(3_600_000));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label name used for the metric name, as in the Prometheus data model
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Labels
// =============================================================================

/// Ordered label set with unique names
///
/// Backed by a `BTreeMap` so that equality, hashing and ordering are defined
/// over the sorted `(name, value)` sequence. Two label sets built in a
/// different insertion order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Create an empty label set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a label set from `(name, value)` pairs; later duplicates win
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Insert or replace a label
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a label value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether a label with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate labels in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this set with the given label names removed
    ///
    /// Used to strip replica labels when deriving deduplication keys and
    /// compaction group keys.
    pub fn without(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|(k, _)| !names.iter().any(|n| n == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Union of two label sets; labels in `other` override labels in `self`
    pub fn merged(&self, other: &Labels) -> Labels {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            out.insert(k.clone(), v.clone());
        }
        Labels(out)
    }

    /// Labels present with the same value in both sets
    pub fn intersection(&self, other: &Labels) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|(k, v)| other.0.get(*k) == Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Identity of the replica that produced data carrying these labels
    ///
    /// Concatenates the values of the configured replica labels in the order
    /// they are configured (`replica=0,prometheus_replica=a`). Returns an empty
    /// string when none of the replica labels are present.
    pub fn replica_identity(&self, replica_labels: &[String]) -> String {
        replica_labels
            .iter()
            .filter_map(|name| self.get(name).map(|v| format!("{}={}", name, v)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", k, v)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Labels::from_pairs(iter)
    }
}

// =============================================================================
// Time Range
// =============================================================================

/// Inclusive time window in milliseconds since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// First millisecond covered
    pub min_time: i64,
    /// Last millisecond covered
    pub max_time: i64,
}

impl TimeRange {
    /// Create a new range, rejecting inverted bounds
    pub fn new(min_time: i64, max_time: i64) -> Result<Self, String> {
        if min_time > max_time {
            return Err(format!(
                "Invalid time range: min_time {} > max_time {}",
                min_time, max_time
            ));
        }
        Ok(Self { min_time, max_time })
    }

    /// Length of the range in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.max_time.saturating_sub(self.min_time)
    }

    /// Whether `ts` lies inside the range
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.min_time && ts <= self.max_time
    }

    /// Whether the two ranges share at least one millisecond
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.min_time <= other.max_time && other.min_time <= self.max_time
    }

    /// Whether `other` starts exactly one millisecond after this range ends
    pub fn is_followed_by(&self, other: &TimeRange) -> bool {
        other.min_time == self.max_time.saturating_add(1)
    }

    /// Whether this range fully contains `other`
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.min_time <= other.min_time && self.max_time >= other.max_time
    }

    /// Overlapping part of two ranges
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(TimeRange {
            min_time: self.min_time.max(other.min_time),
            max_time: self.max_time.min(other.max_time),
        })
    }

    /// Parts of this range not covered by any of `covered`
    ///
    /// `covered` does not need to be sorted or disjoint.
    pub fn subtract(&self, covered: &[TimeRange]) -> Vec<TimeRange> {
        let mut cuts: Vec<TimeRange> = covered
            .iter()
            .filter_map(|c| c.intersect(self))
            .collect();
        cuts.sort_by_key(|c| c.min_time);

        let mut out = Vec::new();
        let mut cursor = self.min_time;
        for cut in cuts {
            if cut.min_time > cursor {
                out.push(TimeRange {
                    min_time: cursor,
                    max_time: cut.min_time - 1,
                });
            }
            cursor = cursor.max(cut.max_time.saturating_add(1));
            if cursor > self.max_time {
                return out;
            }
        }
        if cursor <= self.max_time {
            out.push(TimeRange {
                min_time: cursor,
                max_time: self.max_time,
            });
        }
        out
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min_time, self.max_time)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Downsampling tier of a block
///
/// Ordered from finest to coarsest, so `Raw < FiveMinutes < OneHour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    /// Samples as scraped
    #[serde(rename = "raw")]
    Raw,
    /// 5 minute aggregates of raw data
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 1 hour aggregates of 5 minute data
    #[serde(rename = "1h")]
    OneHour,
}

impl Resolution {
    /// All tiers from finest to coarsest
    pub const ALL: [Resolution; 3] = [Resolution::Raw, Resolution::FiveMinutes, Resolution::OneHour];

    /// Aggregation window in milliseconds (0 for raw)
    pub fn window_ms(&self) -> i64 {
        match self {
            Resolution::Raw => 0,
            Resolution::FiveMinutes => 5 * 60 * 1000,
            Resolution::OneHour => 60 * 60 * 1000,
        }
    }

    /// The tier this one is downsampled into, if any
    pub fn coarser(&self) -> Option<Resolution> {
        match self {
            Resolution::Raw => Some(Resolution::FiveMinutes),
            Resolution::FiveMinutes => Some(Resolution::OneHour),
            Resolution::OneHour => None,
        }
    }

    /// Short name used in configs, metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::FiveMinutes => "5m",
            Resolution::OneHour => "1h",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" | "0" | "0s" => Ok(Resolution::Raw),
            "5m" => Ok(Resolution::FiveMinutes),
            "1h" => Ok(Resolution::OneHour),
            other => Err(format!("Unknown resolution '{}'", other)),
        }
    }
}

// =============================================================================
// Samples and aggregates
// =============================================================================

/// A single `(timestamp, value)` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since epoch
    pub timestamp: i64,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a sample
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Aggregate read from downsampled blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggr {
    /// Minimum per window
    Min,
    /// Maximum per window
    Max,
    /// Sum per window
    Sum,
    /// Sample count per window
    Count,
    /// Reset-compensated counter value at window end
    Counter,
    /// `sum / count`
    #[default]
    Avg,
}

// =============================================================================
// Label matchers
// =============================================================================

/// Matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    RegexMatch,
    /// `!~`
    RegexNotMatch,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::RegexMatch => "=~",
            MatchOp::RegexNotMatch => "!~",
        })
    }
}

/// Maximum accepted regex pattern length
const MAX_PATTERN_LEN: usize = 1000;

/// One label selector term
///
/// Regex matchers are fully anchored, as in PromQL. A label that is absent
/// from a series is treated as having the empty value.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    /// Label name
    pub name: String,
    /// Operator
    pub op: MatchOp,
    /// Literal value or regex pattern
    pub value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Create a matcher, compiling the pattern for regex operators
    pub fn new(
        op: MatchOp,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, String> {
        let name = name.into();
        let value = value.into();
        let regex = match op {
            MatchOp::RegexMatch | MatchOp::RegexNotMatch => {
                if value.len() > MAX_PATTERN_LEN {
                    return Err(format!(
                        "Regex pattern exceeds maximum length of {} characters",
                        MAX_PATTERN_LEN
                    ));
                }
                let anchored = format!("^(?:{})$", value);
                let compiled = regex::RegexBuilder::new(&anchored)
                    .size_limit(1024 * 1024)
                    .build()
                    .map_err(|e| format!("Invalid regex pattern '{}': {}", value, e))?;
                Some(compiled)
            },
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self {
            name,
            op,
            value,
            regex,
        })
    }

    /// `name = value`
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    /// `name != value`
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
            regex: None,
        }
    }

    /// Test a single label value (`None` = label absent)
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        let v = value.unwrap_or("");
        match self.op {
            MatchOp::Equal => v == self.value,
            MatchOp::NotEqual => v != self.value,
            MatchOp::RegexMatch => self.regex.as_ref().is_some_and(|r| r.is_match(v)),
            MatchOp::RegexNotMatch => !self.regex.as_ref().is_some_and(|r| r.is_match(v)),
        }
    }

    /// Test a full label set
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name))
    }
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.name, self.op, self.value)
    }
}

/// Whether every matcher accepts the label set
pub fn matches_all(matchers: &[LabelMatcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

// =============================================================================
// Series query and result fragments
// =============================================================================

/// A label-matcher + time-range query
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    /// Selector terms, all must match
    pub matchers: Vec<LabelMatcher>,
    /// Start of the queried window (inclusive, ms)
    pub min_time: i64,
    /// End of the queried window (inclusive, ms)
    pub max_time: i64,
    /// Coarsest resolution the caller accepts; `None` = auto-select
    pub max_resolution: Option<Resolution>,
    /// Finest resolution the caller wants; conflicting with
    /// `max_resolution` when coarser than it
    pub min_resolution: Option<Resolution>,
    /// Per-query partial response override; `None` = engine default
    pub partial_response: Option<bool>,
    /// Aggregate used when reading downsampled data
    pub aggregate: Aggr,
}

impl SeriesQuery {
    /// Query `[min_time, max_time]` with no matchers and auto resolution
    pub fn new(min_time: i64, max_time: i64) -> Self {
        Self {
            matchers: Vec::new(),
            min_time,
            max_time,
            max_resolution: None,
            min_resolution: None,
            partial_response: None,
            aggregate: Aggr::default(),
        }
    }

    /// Add a matcher
    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Pin the coarsest acceptable resolution
    pub fn with_max_resolution(mut self, resolution: Resolution) -> Self {
        self.max_resolution = Some(resolution);
        self
    }

    /// Request at least this coarse a resolution
    pub fn with_min_resolution(mut self, resolution: Resolution) -> Self {
        self.min_resolution = Some(resolution);
        self
    }

    /// Override the partial response policy
    pub fn with_partial_response(mut self, allowed: bool) -> Self {
        self.partial_response = Some(allowed);
        self
    }

    /// Choose the aggregate read from downsampled blocks
    pub fn with_aggregate(mut self, aggregate: Aggr) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Queried window
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }
}

/// One provider's samples for one series, before deduplication
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFragment {
    /// Full label set, replica labels included
    pub labels: Labels,
    /// Samples ordered by timestamp
    pub samples: Vec<Sample>,
    /// Identity of the replica that produced the fragment
    pub source_replica: String,
}

impl SeriesFragment {
    /// Create a fragment, sorting samples by timestamp
    pub fn new(labels: Labels, mut samples: Vec<Sample>, source_replica: impl Into<String>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self {
            labels,
            samples,
            source_replica: source_replica.into(),
        }
    }
}
