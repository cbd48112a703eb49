//! Configuration management for Panorama
//!
//! TOML file support with environment variable overrides and defaults for
//! every field. Durations are stored as integer seconds or milliseconds in the
//! file and converted into the runtime config structs of each component.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::compact::CompactionConfig;
use crate::error::{Error, ValidationError};
use crate::query::{DedupConfig, DedupFunction, QueryConfig, ResolutionThresholds};
use crate::retry::RetryPolicy;
use crate::store::StorePoolConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Query federation
    #[serde(default)]
    pub query: QuerySection,

    /// Provider fan-out
    #[serde(default)]
    pub store: StoreSection,

    /// Compaction and downsampling
    #[serde(default)]
    pub compaction: CompactionSection,

    /// Bucket location and access
    #[serde(default)]
    pub storage: StorageSection,

    /// Logging and metrics
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

/// Query federation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuerySection {
    /// Labels identifying a replica
    #[serde(default = "default_replica_labels")]
    pub replica_labels: Vec<String>,

    /// Preferred replicas, best first
    #[serde(default)]
    pub replica_preference: Vec<String>,

    /// Deduplication rule (penalty | latest)
    #[serde(default)]
    pub dedup_function: DedupFunction,

    /// Timestamp distance treated as the same point by `latest`
    #[serde(default)]
    pub skew_tolerance_ms: i64,

    /// Ranges shorter than this read raw data only
    #[serde(default = "default_raw_max_range_secs")]
    pub raw_max_range_secs: u64,

    /// Ranges up to this read raw and 5m data
    #[serde(default = "default_five_minute_max_range_secs")]
    pub five_minute_max_range_secs: u64,

    /// Whole-query timeout
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Accept partial results unless a query says otherwise
    #[serde(default = "default_true")]
    pub partial_response: bool,

    /// Keep providers serving only coarser data
    #[serde(default)]
    pub auto_downsampling: bool,
}

/// Provider fan-out configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSection {
    /// Provider calls in flight across all queries
    #[serde(default = "default_max_concurrent_select")]
    pub max_concurrent_select: usize,

    /// Timeout of one provider call
    #[serde(default = "default_per_provider_timeout_ms")]
    pub per_provider_timeout_ms: u64,

    /// Retry of transient provider failures
    #[serde(default)]
    pub retry: RetrySection,
}

/// Compaction configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionSection {
    /// Seconds between planning passes
    #[serde(default = "default_compaction_interval_secs")]
    pub interval_secs: u64,

    /// Minimum block age before compaction
    #[serde(default = "default_consistency_delay_secs")]
    pub consistency_delay_secs: u64,

    /// Time a marked block is kept before purge
    #[serde(default = "default_delete_delay_secs")]
    pub delete_delay_secs: u64,

    /// Horizontal compaction windows, smallest first
    #[serde(default = "default_block_ranges_secs")]
    pub block_ranges_secs: Vec<u64>,

    /// Produce downsampled siblings
    #[serde(default = "default_true")]
    pub downsampling_enabled: bool,

    /// Raw block age before a 5m sibling is built
    #[serde(default = "default_raw_max_range_secs")]
    pub downsample_raw_after_secs: u64,

    /// 5m block age before a 1h sibling is built
    #[serde(default = "default_five_minute_max_range_secs")]
    pub downsample_5m_after_secs: u64,

    /// Consecutive failures before a group halts (0 = never)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Jobs running at once across all groups
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Work queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Bucket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
    /// Directory backing the bucket
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: PathBuf,

    /// Seconds between bucket syncs
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Retry of transient bucket failures
    #[serde(default)]
    pub retry: RetrySection,
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySection {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomize delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringSection {
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Print metrics in text format on shutdown
    #[serde(default)]
    pub dump_metrics_on_exit: bool,
}

// Default value functions
fn default_replica_labels() -> Vec<String> {
    vec!["replica".to_string(), "prometheus_replica".to_string()]
}
fn default_raw_max_range_secs() -> u64 { 40 * 3600 }
fn default_five_minute_max_range_secs() -> u64 { 10 * 24 * 3600 }
fn default_query_timeout_secs() -> u64 { 120 }
fn default_max_concurrent_select() -> usize { 20 }
fn default_per_provider_timeout_ms() -> u64 { 10_000 }
fn default_compaction_interval_secs() -> u64 { 300 }
fn default_consistency_delay_secs() -> u64 { 1800 }
fn default_delete_delay_secs() -> u64 { 48 * 3600 }
fn default_block_ranges_secs() -> Vec<u64> {
    vec![2 * 3600, 8 * 3600, 2 * 24 * 3600, 14 * 24 * 3600]
}
fn default_max_consecutive_failures() -> u32 { 3 }
fn default_max_concurrent_jobs() -> usize { 2 }
fn default_queue_capacity() -> usize { 100 }
fn default_bucket_dir() -> PathBuf { PathBuf::from("/var/lib/panorama/bucket") }
fn default_sync_interval_secs() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 5000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            replica_labels: default_replica_labels(),
            replica_preference: Vec::new(),
            dedup_function: DedupFunction::default(),
            skew_tolerance_ms: 0,
            raw_max_range_secs: default_raw_max_range_secs(),
            five_minute_max_range_secs: default_five_minute_max_range_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            partial_response: true,
            auto_downsampling: false,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            max_concurrent_select: default_max_concurrent_select(),
            per_provider_timeout_ms: default_per_provider_timeout_ms(),
            retry: RetrySection::default(),
        }
    }
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            interval_secs: default_compaction_interval_secs(),
            consistency_delay_secs: default_consistency_delay_secs(),
            delete_delay_secs: default_delete_delay_secs(),
            block_ranges_secs: default_block_ranges_secs(),
            downsampling_enabled: true,
            downsample_raw_after_secs: default_raw_max_range_secs(),
            downsample_5m_after_secs: default_five_minute_max_range_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            bucket_dir: default_bucket_dir(),
            sync_interval_secs: default_sync_interval_secs(),
            retry: RetrySection::default(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dump_metrics_on_exit: false,
        }
    }
}

impl RetrySection {
    /// Runtime retry policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

impl ApplicationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Failed to read config file {}: {}", path, e)))?;
        Self::from_toml(&contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file {}: {}", path, e)))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Load configuration from a file and apply environment overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, Error> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `PANORAMA_*` environment variable overrides
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        // Query
        if let Ok(labels) = std::env::var("PANORAMA_REPLICA_LABELS") {
            self.query.replica_labels = labels
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(function) = parsed("PANORAMA_DEDUP_FUNCTION") {
            self.query.dedup_function = function;
        }
        if let Some(secs) = parsed("PANORAMA_QUERY_TIMEOUT_SECS") {
            self.query.query_timeout_secs = secs;
        }
        if let Some(partial) = parsed("PANORAMA_PARTIAL_RESPONSE") {
            self.query.partial_response = partial;
        }

        // Store
        if let Some(max) = parsed("PANORAMA_MAX_CONCURRENT_SELECT") {
            self.store.max_concurrent_select = max;
        }

        // Compaction
        if let Some(secs) = parsed("PANORAMA_COMPACTION_INTERVAL_SECS") {
            self.compaction.interval_secs = secs;
        }
        if let Some(jobs) = parsed("PANORAMA_MAX_CONCURRENT_JOBS") {
            self.compaction.max_concurrent_jobs = jobs;
        }

        // Storage
        if let Ok(dir) = std::env::var("PANORAMA_BUCKET_DIR") {
            self.storage.bucket_dir = PathBuf::from(dir);
        }

        // Monitoring
        if let Ok(level) = std::env::var("PANORAMA_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.query.replica_labels.iter().any(|l| l.is_empty()) {
            return Err(ValidationError::InvalidFormat {
                field: "query.replica_labels".to_string(),
                message: "label names cannot be empty".to_string(),
            });
        }
        if self.query.skew_tolerance_ms < 0 {
            return Err(out_of_range("query.skew_tolerance_ms", self.query.skew_tolerance_ms, 0, i64::MAX));
        }
        if self.query.raw_max_range_secs == 0
            || self.query.raw_max_range_secs > self.query.five_minute_max_range_secs
        {
            return Err(ValidationError::Failed(format!(
                "query.raw_max_range_secs ({}) must be > 0 and <= query.five_minute_max_range_secs ({})",
                self.query.raw_max_range_secs, self.query.five_minute_max_range_secs
            )));
        }
        if self.query.query_timeout_secs == 0 {
            return Err(out_of_range("query.query_timeout_secs", 0, 1, u64::MAX));
        }

        if self.store.max_concurrent_select == 0 {
            return Err(out_of_range("store.max_concurrent_select", 0, 1, usize::MAX));
        }
        if self.store.per_provider_timeout_ms == 0 {
            return Err(out_of_range("store.per_provider_timeout_ms", 0, 1, u64::MAX));
        }

        let c = &self.compaction;
        if c.interval_secs == 0 {
            return Err(out_of_range("compaction.interval_secs", 0, 1, u64::MAX));
        }
        if c.block_ranges_secs.is_empty() {
            return Err(ValidationError::MissingField("compaction.block_ranges_secs".to_string()));
        }
        if c.block_ranges_secs.windows(2).any(|w| w[0] >= w[1]) || c.block_ranges_secs[0] == 0 {
            return Err(ValidationError::InvalidFormat {
                field: "compaction.block_ranges_secs".to_string(),
                message: "ranges must be positive and strictly increasing".to_string(),
            });
        }
        if c.max_concurrent_jobs == 0 {
            return Err(out_of_range("compaction.max_concurrent_jobs", 0, 1, usize::MAX));
        }
        if c.queue_capacity == 0 {
            return Err(out_of_range("compaction.queue_capacity", 0, 1, usize::MAX));
        }

        if self.storage.bucket_dir.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("storage.bucket_dir".to_string()));
        }
        for (field, retry) in [("store.retry", &self.store.retry), ("storage.retry", &self.storage.retry)] {
            if retry.multiplier < 1.0 {
                return Err(ValidationError::Failed(format!("{}.multiplier must be >= 1.0", field)));
            }
        }
        Ok(())
    }

    /// Runtime query engine settings
    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            dedup: DedupConfig {
                replica_labels: self.query.replica_labels.clone(),
                replica_preference: self.query.replica_preference.clone(),
                function: self.query.dedup_function,
                skew_tolerance_ms: self.query.skew_tolerance_ms,
            },
            thresholds: ResolutionThresholds {
                raw_max_range: Duration::from_secs(self.query.raw_max_range_secs),
                five_minute_max_range: Duration::from_secs(self.query.five_minute_max_range_secs),
            },
            query_timeout: Duration::from_secs(self.query.query_timeout_secs),
            partial_response: self.query.partial_response,
            auto_downsampling: self.query.auto_downsampling,
        }
    }

    /// Runtime provider pool settings
    pub fn store_pool_config(&self) -> StorePoolConfig {
        StorePoolConfig {
            max_concurrent_select: self.store.max_concurrent_select,
            per_provider_timeout: Duration::from_millis(self.store.per_provider_timeout_ms),
            retry: self.store.retry.policy(),
        }
    }

    /// Runtime compaction settings
    pub fn compaction_config(&self) -> CompactionConfig {
        let c = &self.compaction;
        CompactionConfig {
            interval: Duration::from_secs(c.interval_secs),
            consistency_delay: Duration::from_secs(c.consistency_delay_secs),
            delete_delay: Duration::from_secs(c.delete_delay_secs),
            block_ranges: c.block_ranges_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            downsampling_enabled: c.downsampling_enabled,
            downsample_raw_after: Duration::from_secs(c.downsample_raw_after_secs),
            downsample_5m_after: Duration::from_secs(c.downsample_5m_after_secs),
            max_consecutive_failures: c.max_consecutive_failures,
            max_concurrent_jobs: c.max_concurrent_jobs,
            queue_capacity: c.queue_capacity,
            replica_labels: self.query.replica_labels.clone(),
            replica_preference: self.query.replica_preference.clone(),
        }
    }

    /// Runtime bucket retry policy
    pub fn storage_retry_policy(&self) -> RetryPolicy {
        self.storage.retry.policy()
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), Error> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)
            .map_err(|e| Error::Configuration(format!("Failed to write config file {}: {}", path, e)))
    }
}

fn out_of_range<T: ToString>(field: &str, value: T, min: T, max: T) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApplicationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.query.replica_labels, vec!["replica", "prometheus_replica"]);
        assert_eq!(config.store.max_concurrent_select, 20);
        assert_eq!(config.compaction.block_ranges_secs.len(), 4);

        let compaction = config.compaction_config();
        assert_eq!(compaction.downsample_raw_after, Duration::from_secs(40 * 3600));
        assert_eq!(compaction.replica_labels, config.query.replica_labels);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ApplicationConfig::from_toml(
            r#"
            [query]
            dedup_function = "latest"
            skew_tolerance_ms = 500
            replica_preference = ["replica=0"]

            [compaction]
            max_concurrent_jobs = 4

            [storage]
            bucket_dir = "/tmp/bucket"
            "#,
        )
        .unwrap();
        assert_eq!(config.query.dedup_function, DedupFunction::Latest);
        assert_eq!(config.query_config().dedup.skew_tolerance_ms, 500);
        assert_eq!(config.query.query_timeout_secs, 120);
        assert_eq!(config.compaction.max_concurrent_jobs, 4);
        assert_eq!(config.compaction.queue_capacity, 100);
        assert_eq!(config.storage.bucket_dir, PathBuf::from("/tmp/bucket"));
        assert_eq!(config.store_pool_config().per_provider_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ApplicationConfig::default();
        config.store.max_concurrent_select = 0;
        assert!(matches!(config.validate(), Err(ValidationError::OutOfRange { .. })));

        let mut config = ApplicationConfig::default();
        config.compaction.block_ranges_secs = vec![7200, 3600];
        assert!(matches!(config.validate(), Err(ValidationError::InvalidFormat { .. })));

        let mut config = ApplicationConfig::default();
        config.query.raw_max_range_secs = config.query.five_minute_max_range_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PANORAMA_MAX_CONCURRENT_SELECT", "7");
        std::env::set_var("PANORAMA_REPLICA_LABELS", "replica, rack");
        let config = ApplicationConfig::from_env();
        assert_eq!(config.store.max_concurrent_select, 7);
        assert_eq!(config.query.replica_labels, vec!["replica", "rack"]);
        std::env::remove_var("PANORAMA_MAX_CONCURRENT_SELECT");
        std::env::remove_var("PANORAMA_REPLICA_LABELS");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panorama.toml");
        let path = path.to_str().unwrap();

        let mut config = ApplicationConfig::default();
        config.compaction.queue_capacity = 12;
        config.save_to_file(path).unwrap();

        let loaded = ApplicationConfig::from_file(path).unwrap();
        assert_eq!(loaded.compaction.queue_capacity, 12);
        assert!(loaded.validate().is_ok());
    }
}
