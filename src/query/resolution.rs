//! Resolution selection
//!
//! Wide queries read coarser data so that the bytes scanned stay bounded.
//! Without pinning, the tiers are chosen from the range length:
//!
//! ```text
//! range <  40h        → raw
//! 40h  <= range <= 10d → raw + 5m
//! range >  10d        → 5m + 1h
//! ```

use std::time::Duration;

use super::error::{QueryError, QueryResult};
use crate::types::{Resolution, SeriesQuery};

/// Range-length thresholds for automatic selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionThresholds {
    /// Ranges shorter than this read raw data only
    /// Default: 40 hours
    pub raw_max_range: Duration,

    /// Ranges up to this read raw and 5m data; longer ranges read 5m and 1h
    /// Default: 10 days
    pub five_minute_max_range: Duration,
}

impl Default for ResolutionThresholds {
    fn default() -> Self {
        Self {
            raw_max_range: Duration::from_secs(40 * 3600),
            five_minute_max_range: Duration::from_secs(10 * 24 * 3600),
        }
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Tiers picked from the range length alone, finest first
pub fn auto_select(range_ms: i64, thresholds: &ResolutionThresholds) -> Vec<Resolution> {
    if range_ms < duration_ms(thresholds.raw_max_range) {
        vec![Resolution::Raw]
    } else if range_ms <= duration_ms(thresholds.five_minute_max_range) {
        vec![Resolution::Raw, Resolution::FiveMinutes]
    } else {
        vec![Resolution::FiveMinutes, Resolution::OneHour]
    }
}

fn tiers_between(lo: Resolution, hi: Resolution) -> Vec<Resolution> {
    Resolution::ALL
        .into_iter()
        .filter(|r| *r >= lo && *r <= hi)
        .collect()
}

/// Tiers a query reads, finest first
///
/// `max_resolution` pins the coarsest tier; the query then reads every tier
/// from `min_resolution` (or raw) up to it. `min_resolution` alone shifts the
/// automatic choice to at least that tier. A `min_resolution` coarser than
/// `max_resolution` is ambiguous.
pub fn select_resolutions(
    query: &SeriesQuery,
    thresholds: &ResolutionThresholds,
) -> QueryResult<Vec<Resolution>> {
    match (query.min_resolution, query.max_resolution) {
        (Some(min), Some(max)) if min > max => Err(QueryError::ambiguous_resolution(format!(
            "minimum resolution {} is coarser than maximum resolution {}",
            min, max
        ))),
        (min, Some(max)) => Ok(tiers_between(min.unwrap_or(Resolution::Raw), max)),
        (Some(min), None) => {
            let auto = auto_select(query.max_time.saturating_sub(query.min_time), thresholds);
            let upper = auto.last().copied().unwrap_or(Resolution::Raw).max(min);
            Ok(tiers_between(min, upper))
        },
        (None, None) => Ok(auto_select(query.max_time.saturating_sub(query.min_time), thresholds)),
    }
}
