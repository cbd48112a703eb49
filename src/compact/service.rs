//! Compaction Service
//!
//! Periodic loop around the [`Planner`] and the [`Executor`]:
//!
//! - each tick purges expired blocks, plans jobs and queues them
//! - a fixed pool of workers drains the queue
//! - results feed a [`FailureTracker`] that halts a group after too many
//!   consecutive failures, until an operator resumes it

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use super::executor::Executor;
use super::planner::{CompactionJob, Planner};
use super::CompactionConfig;
use crate::block::{self, BlockMeta, GroupKey};
use crate::error::CompactionError;
use crate::metastore::MetaStore;
use crate::metrics;
use crate::objstore::ObjectStore;
use crate::services::{Service, ServiceError, ServiceStatus};
use crate::types::now_ms;

// ============================================================================
// Failure Tracking
// ============================================================================

/// Consecutive failure counts per compaction group
#[derive(Debug)]
pub struct FailureTracker {
    /// Failures tolerated before halting; 0 never halts
    max_consecutive: u32,
    consecutive: Mutex<HashMap<GroupKey, u32>>,
    halted: Mutex<HashSet<GroupKey>>,
}

impl FailureTracker {
    /// Create a tracker
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive,
            consecutive: Mutex::new(HashMap::new()),
            halted: Mutex::new(HashSet::new()),
        }
    }

    /// Reset the failure count of a group
    pub fn record_success(&self, group: &GroupKey) {
        self.consecutive.lock().remove(group);
    }

    /// Count a failure; returns true when this failure halts the group
    pub fn record_failure(&self, group: &GroupKey) -> bool {
        let mut consecutive = self.consecutive.lock();
        let count = consecutive.entry(group.clone()).or_insert(0);
        *count += 1;
        if self.max_consecutive > 0 && *count >= self.max_consecutive {
            return self.halted.lock().insert(group.clone());
        }
        false
    }

    /// Current consecutive failures of a group
    pub fn failures(&self, group: &GroupKey) -> u32 {
        self.consecutive.lock().get(group).copied().unwrap_or(0)
    }

    /// Group is halted
    pub fn is_halted(&self, group: &GroupKey) -> bool {
        self.halted.lock().contains(group)
    }

    /// All halted groups
    pub fn halted_groups(&self) -> Vec<GroupKey> {
        let mut groups: Vec<GroupKey> = self.halted.lock().iter().cloned().collect();
        groups.sort();
        groups
    }

    /// Lift a halt and forget past failures; returns false if not halted
    pub fn resume(&self, group: &GroupKey) -> bool {
        self.consecutive.lock().remove(group);
        self.halted.lock().remove(group)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for the compaction service
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    /// Planning passes run
    pub cycles: u64,
    /// Jobs planned
    pub jobs_planned: u64,
    /// Jobs that produced a block
    pub jobs_completed: u64,
    /// Jobs that failed
    pub jobs_failed: u64,
    /// Jobs dropped because the queue was full
    pub jobs_rejected: u64,
    /// Blocks purged after their delete delay
    pub blocks_purged: u64,
    /// Time of the last planning pass
    pub last_cycle: Option<Instant>,
}

/// Outcome of one planning pass run to completion
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Blocks purged
    pub purged: usize,
    /// Jobs planned
    pub planned: usize,
    /// Jobs dropped because the queue was full
    pub rejected: usize,
    /// Blocks written by successful jobs
    pub outputs: Vec<BlockMeta>,
    /// Failed jobs with their errors
    pub failures: Vec<(u64, CompactionError)>,
    /// Groups halted during this pass
    pub halted: Vec<GroupKey>,
}

struct JobOutcome {
    job: CompactionJob,
    result: Result<BlockMeta, CompactionError>,
}

// ============================================================================
// Compaction Service
// ============================================================================

/// Background compaction of a bucket
pub struct CompactionService {
    config: CompactionConfig,
    metastore: Arc<MetaStore>,
    bucket: Arc<dyn ObjectStore>,
    planner: Planner,
    executor: Arc<Executor>,
    failures: FailureTracker,
    in_flight: Mutex<HashSet<GroupKey>>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<CompactionStats>,
}

impl CompactionService {
    /// Create a compaction service
    pub fn new(config: CompactionConfig, metastore: Arc<MetaStore>, bucket: Arc<dyn ObjectStore>) -> Self {
        let executor = Arc::new(Executor::new(config.clone(), metastore.clone(), bucket.clone()));
        Self {
            planner: Planner::new(config.clone()),
            failures: FailureTracker::new(config.max_consecutive_failures),
            config,
            metastore,
            bucket,
            executor,
            in_flight: Mutex::new(HashSet::new()),
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(CompactionStats::default()),
        }
    }

    /// Get compaction statistics
    pub fn stats(&self) -> CompactionStats {
        self.stats.read().clone()
    }

    /// Failure tracking state
    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Lift the halt of a group so it is planned again
    pub fn resume_group(&self, group: &GroupKey) -> bool {
        let resumed = self.failures.resume(group);
        if resumed {
            metrics::set_group_halted(&group.to_string(), false);
            info!(group = %group, "Compaction group resumed");
        }
        resumed
    }

    /// Run one full pass: purge, plan, execute every queued job, report
    pub async fn run_once(&self) -> CycleReport {
        let now = now_ms();
        let mut report = CycleReport {
            purged: self.purge(now).await,
            ..Default::default()
        };

        let jobs = self.plan(now);
        report.planned = jobs.len();

        let capacity = self.config.queue_capacity.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, mut result_rx) = mpsc::channel(capacity);
        let workers = self.spawn_workers(job_rx, result_tx);

        report.rejected = self.enqueue(jobs, &job_tx);
        drop(job_tx);

        while let Some(outcome) = result_rx.recv().await {
            self.record_outcome(outcome, &mut report);
        }
        for worker in workers {
            let _ = worker.await;
        }
        metrics::COMPACTION_QUEUE_DEPTH.set(0.0);
        report
    }

    /// Purge blocks past their delete delay and remove their objects
    async fn purge(&self, now: i64) -> usize {
        let purged = self.metastore.purge_expired(now, self.config.delete_delay);
        for meta in &purged {
            if let Err(e) = block::delete_block(self.bucket.as_ref(), meta).await {
                warn!(block_id = %meta.block_id, error = %e, "Failed to delete purged block objects");
            }
        }
        self.stats.write().blocks_purged += purged.len() as u64;
        purged.len()
    }

    fn plan(&self, now: i64) -> Vec<CompactionJob> {
        let mut skip: HashSet<GroupKey> = self.in_flight.lock().clone();
        skip.extend(self.failures.halted_groups());

        let jobs = self.planner.plan(&self.metastore.all_blocks(), now, &skip);
        let mut stats = self.stats.write();
        stats.cycles += 1;
        stats.jobs_planned += jobs.len() as u64;
        stats.last_cycle = Some(Instant::now());
        jobs
    }

    /// Queue jobs without waiting; returns the number rejected
    fn enqueue(&self, jobs: Vec<CompactionJob>, queue: &mpsc::Sender<CompactionJob>) -> usize {
        let capacity = self.config.queue_capacity.max(1);
        let mut rejected = 0;
        for job in jobs {
            let group = job.group.clone();
            self.in_flight.lock().insert(group.clone());
            match queue.try_send(job) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.in_flight.lock().remove(&group);
                    rejected += 1;
                    debug!(
                        job_id = job.id,
                        group = %group,
                        error = %CompactionError::QueueFull(capacity),
                        "Compaction job not queued"
                    );
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.in_flight.lock().remove(&group);
                    break;
                },
            }
        }
        if rejected > 0 {
            warn!(rejected, capacity, "Compaction queue full, jobs deferred to the next pass");
        }
        self.stats.write().jobs_rejected += rejected as u64;
        metrics::COMPACTION_QUEUE_DEPTH.set((capacity - queue.capacity()) as f64);
        rejected
    }

    fn spawn_workers(
        &self,
        jobs: mpsc::Receiver<CompactionJob>,
        results: mpsc::Sender<JobOutcome>,
    ) -> Vec<JoinHandle<()>> {
        let jobs = Arc::new(tokio::sync::Mutex::new(jobs));
        (0..self.config.max_concurrent_jobs.max(1))
            .map(|_| {
                let jobs = Arc::clone(&jobs);
                let results = results.clone();
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    loop {
                        let next = jobs.lock().await.recv().await;
                        let Some(job) = next else { break };
                        let result = executor.execute(&job, now_ms()).await;
                        if results.send(JobOutcome { job, result }).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    fn record_outcome(&self, outcome: JobOutcome, report: &mut CycleReport) {
        let JobOutcome { job, result } = outcome;
        self.in_flight.lock().remove(&job.group);

        match result {
            Ok(meta) => {
                self.failures.record_success(&job.group);
                self.stats.write().jobs_completed += 1;
                report.outputs.push(meta);
            },
            Err(CompactionError::GroupBusy(group)) => {
                debug!(job_id = job.id, group = %group, "Group busy, job skipped");
            },
            Err(e) => {
                self.stats.write().jobs_failed += 1;
                if self.failures.record_failure(&job.group) {
                    error!(
                        group = %job.group,
                        failures = self.failures.failures(&job.group),
                        last_error = %e,
                        "Compaction group halted after repeated failures"
                    );
                    metrics::set_group_halted(&job.group.to_string(), true);
                    report.halted.push(job.group.clone());
                }
                report.failures.push((job.id, e));
            },
        }
    }
}

#[async_trait::async_trait]
impl Service for CompactionService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.max_concurrent_jobs,
            "Compaction service started"
        );

        let capacity = self.config.queue_capacity.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, mut result_rx) = mpsc::channel(capacity);
        let workers = self.spawn_workers(job_rx, result_tx);
        let mut tick = interval(self.config.interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Compaction service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Compaction service broadcast receiver lagged");
                        }
                    }
                }

                _ = tick.tick() => {
                    let now = now_ms();
                    self.purge(now).await;
                    let jobs = self.plan(now);
                    self.enqueue(jobs, &job_tx);
                }

                Some(outcome) = result_rx.recv() => {
                    self.record_outcome(outcome, &mut CycleReport::default());
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopping;
        // Let queued jobs finish so no group is left half-processed
        drop(job_tx);
        while let Some(outcome) = result_rx.recv().await {
            self.record_outcome(outcome, &mut CycleReport::default());
        }
        for worker in workers {
            let _ = worker.await;
        }

        *self.status.write() = ServiceStatus::Stopped;
        info!("Compaction service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "compaction"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["bucket-sync"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn group(name: &str) -> GroupKey {
        GroupKey::new(Labels::from_pairs([("cluster", name)]))
    }

    #[test]
    fn test_failure_tracker_halts_and_resumes() {
        let tracker = FailureTracker::new(3);
        let g = group("eu");

        assert!(!tracker.record_failure(&g));
        assert!(!tracker.record_failure(&g));
        tracker.record_success(&g);
        assert_eq!(tracker.failures(&g), 0);

        assert!(!tracker.record_failure(&g));
        assert!(!tracker.record_failure(&g));
        assert!(tracker.record_failure(&g));
        assert!(tracker.is_halted(&g));
        // already halted
        assert!(!tracker.record_failure(&g));
        assert!(!tracker.is_halted(&group("us")));

        assert!(tracker.resume(&g));
        assert!(!tracker.is_halted(&g));
        assert_eq!(tracker.failures(&g), 0);
        assert!(!tracker.resume(&g));
    }

    #[test]
    fn test_failure_tracker_zero_never_halts() {
        let tracker = FailureTracker::new(0);
        let g = group("eu");
        for _ in 0..10 {
            assert!(!tracker.record_failure(&g));
        }
        assert!(tracker.halted_groups().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_on_empty_bucket() {
        let metastore = Arc::new(MetaStore::new());
        let bucket = Arc::new(crate::objstore::InMemoryObjectStore::new());
        let service = CompactionService::new(CompactionConfig::default(), metastore, bucket);
        let report = service.run_once().await;
        assert_eq!(report.planned, 0);
        assert!(report.outputs.is_empty());
        assert_eq!(service.stats().cycles, 1);
    }

    #[tokio::test]
    async fn test_service_stops_on_shutdown() {
        let metastore = Arc::new(MetaStore::new());
        let bucket = Arc::new(crate::objstore::InMemoryObjectStore::new());
        let service = Arc::new(CompactionService::new(CompactionConfig::default(), metastore, bucket));

        let (tx, rx) = broadcast::channel(1);
        let runner = service.clone();
        let task = tokio::spawn(async move { runner.start(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }
}
