//! Metrics and telemetry for the federation and compaction layers
//!
//! Prometheus metrics covering query outcomes, provider fan-out, deduplication,
//! block lifecycle and compaction. Render them with [`gather_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec,
    Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Query ===

    /// Queries by outcome (success, partial, timeout, no_match, error)
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "panorama_queries_total",
        "Total federated queries by outcome",
        &["outcome"]
    ).unwrap();

    /// End-to-end query latency
    pub static ref QUERY_DURATION: Histogram = register_histogram!(
        "panorama_query_duration_seconds",
        "Federated query latency in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    /// Provider calls by outcome
    pub static ref PROVIDER_REQUESTS: CounterVec = register_counter_vec!(
        "panorama_provider_requests_total",
        "Series calls issued to providers by outcome",
        &["provider", "outcome"]
    ).unwrap();

    /// Queries answered with at least one warning
    pub static ref PARTIAL_RESPONSES: Counter = register_counter!(
        "panorama_partial_responses_total",
        "Queries that returned a partial response"
    ).unwrap();

    /// Replica samples discarded by deduplication
    pub static ref DEDUP_SAMPLES_DROPPED: Counter = register_counter!(
        "panorama_dedup_samples_dropped_total",
        "Samples dropped while deduplicating replicas"
    ).unwrap();

    // === Blocks ===

    /// Blocks registered in the metadata store
    pub static ref BLOCKS_REGISTERED: Counter = register_counter!(
        "panorama_blocks_registered_total",
        "Blocks registered in the metadata store"
    ).unwrap();

    /// Blocks marked for deletion
    pub static ref BLOCKS_MARKED: Counter = register_counter!(
        "panorama_blocks_marked_for_deletion_total",
        "Blocks marked for deletion"
    ).unwrap();

    /// Blocks removed after their delete delay
    pub static ref BLOCKS_PURGED: Counter = register_counter!(
        "panorama_blocks_purged_total",
        "Blocks removed after the delete delay expired"
    ).unwrap();

    /// Active blocks per resolution
    pub static ref ACTIVE_BLOCKS: GaugeVec = register_gauge_vec!(
        "panorama_active_blocks",
        "Active (not deletion-marked) blocks by resolution",
        &["resolution"]
    ).unwrap();

    // === Compaction ===

    /// Compaction jobs by kind and outcome
    pub static ref COMPACTION_JOBS: CounterVec = register_counter_vec!(
        "panorama_compaction_jobs_total",
        "Compaction jobs by kind and outcome",
        &["kind", "outcome"]
    ).unwrap();

    /// Compaction job latency
    pub static ref COMPACTION_DURATION: HistogramVec = register_histogram_vec!(
        "panorama_compaction_duration_seconds",
        "Compaction job latency in seconds",
        &["kind"],
        vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    ).unwrap();

    /// Jobs waiting in the work queue
    pub static ref COMPACTION_QUEUE_DEPTH: Gauge = register_gauge!(
        "panorama_compaction_queue_depth",
        "Compaction jobs waiting for a worker"
    ).unwrap();

    /// 1 while compaction is halted for a group
    pub static ref COMPACTION_GROUP_HALTED: GaugeVec = register_gauge_vec!(
        "panorama_compaction_group_halted",
        "Set to 1 when compaction for a group is halted after repeated failures",
        &["group"]
    ).unwrap();
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a finished query
#[inline]
pub fn record_query(outcome: &str, duration_secs: f64) {
    QUERIES_TOTAL.with_label_values(&[outcome]).inc();
    QUERY_DURATION.observe(duration_secs);
}

/// Record one provider call
#[inline]
pub fn record_provider_request(provider: &str, outcome: &str) {
    PROVIDER_REQUESTS
        .with_label_values(&[provider, outcome])
        .inc();
}

/// Record a finished compaction job
#[inline]
pub fn record_compaction(kind: &str, duration_secs: f64, success: bool) {
    let outcome = if success { "success" } else { "error" };

    COMPACTION_JOBS.with_label_values(&[kind, outcome]).inc();
    COMPACTION_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Flag a compaction group as halted or resumed
#[inline]
pub fn set_group_halted(group: &str, halted: bool) {
    COMPACTION_GROUP_HALTED
        .with_label_values(&[group])
        .set(if halted { 1.0 } else { 0.0 });
}

/// Update the active block gauge for one resolution
#[inline]
pub fn update_active_blocks(resolution: &str, count: usize) {
    ACTIVE_BLOCKS
        .with_label_values(&[resolution])
        .set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_query() {
        record_query("success", 0.01);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("panorama_queries_total"));
        assert!(metrics.contains("panorama_query_duration_seconds"));
    }

    #[test]
    fn test_group_halted_gauge() {
        set_group_halted("{cluster=\"test\"}", true);
        assert_eq!(
            COMPACTION_GROUP_HALTED
                .with_label_values(&["{cluster=\"test\"}"])
                .get(),
            1.0
        );
        set_group_halted("{cluster=\"test\"}", false);
        assert_eq!(
            COMPACTION_GROUP_HALTED
                .with_label_values(&["{cluster=\"test\"}"])
                .get(),
            0.0
        );
    }
}
