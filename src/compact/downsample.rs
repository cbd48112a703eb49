//! Downsampling of block series into fixed windows
//!
//! Raw samples become one [`AggrSample`] per window; already aggregated
//! series are folded into a coarser window the same way. The `counter`
//! aggregate compensates resets: when a value drops below its predecessor
//! the predecessor is added to a running offset, so the stored counter only
//! ever grows within a series.

use crate::block::{AggrSample, BlockSeries};
use crate::types::Sample;

/// Running reset compensation for one series
#[derive(Debug, Default)]
struct CounterState {
    offset: f64,
    prev: Option<f64>,
}

impl CounterState {
    fn observe(&mut self, value: f64) -> f64 {
        if let Some(prev) = self.prev {
            if value < prev {
                self.offset += prev;
            }
        }
        self.prev = Some(value);
        self.offset + value
    }
}

/// Accumulator for the window being built
#[derive(Debug)]
struct Window {
    index: i64,
    aggr: AggrSample,
}

impl Window {
    fn open(index: i64, timestamp: i64) -> Self {
        Self {
            index,
            aggr: AggrSample {
                timestamp,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
                count: 0,
                counter: 0.0,
            },
        }
    }
}

fn fold_series<P>(
    points: &[P],
    window_ms: i64,
    timestamp: impl Fn(&P) -> i64,
    mut add: impl FnMut(&mut AggrSample, &P, &mut CounterState),
) -> Vec<AggrSample> {
    let mut out = Vec::new();
    let mut counter = CounterState::default();
    let mut current: Option<Window> = None;

    for point in points {
        let ts = timestamp(point);
        let index = ts.div_euclid(window_ms);
        match current.as_mut() {
            Some(w) if w.index == index => {},
            _ => {
                if let Some(done) = current.take() {
                    out.push(done.aggr);
                }
                current = Some(Window::open(index, ts));
            },
        }
        if let Some(w) = current.as_mut() {
            w.aggr.timestamp = ts;
            add(&mut w.aggr, point, &mut counter);
        }
    }
    if let Some(done) = current {
        out.push(done.aggr);
    }
    out
}

/// Aggregate raw series into windows of `window_ms`
///
/// Each window is stamped with the timestamp of its last sample.
pub fn downsample_raw(series: &[BlockSeries<Sample>], window_ms: i64) -> Vec<BlockSeries<AggrSample>> {
    series
        .iter()
        .filter(|s| !s.points.is_empty())
        .map(|s| {
            let points = fold_series(
                &s.points,
                window_ms,
                |p| p.timestamp,
                |acc, p, counter| {
                    acc.min = acc.min.min(p.value);
                    acc.max = acc.max.max(p.value);
                    acc.sum += p.value;
                    acc.count += 1;
                    acc.counter = counter.observe(p.value);
                },
            );
            BlockSeries::new(s.labels.clone(), points)
        })
        .collect()
}

/// Fold aggregated series into coarser windows of `window_ms`
pub fn downsample_aggregated(
    series: &[BlockSeries<AggrSample>],
    window_ms: i64,
) -> Vec<BlockSeries<AggrSample>> {
    series
        .iter()
        .filter(|s| !s.points.is_empty())
        .map(|s| {
            let points = fold_series(
                &s.points,
                window_ms,
                |p| p.timestamp,
                |acc, p, counter| {
                    acc.min = acc.min.min(p.min);
                    acc.max = acc.max.max(p.max);
                    acc.sum += p.sum;
                    acc.count += p.count;
                    acc.counter = counter.observe(p.counter);
                },
            );
            BlockSeries::new(s.labels.clone(), points)
        })
        .collect()
}
