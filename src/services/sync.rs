//! Bucket Sync Service
//!
//! Keeps the metadata store in step with blocks that other processes upload
//! to, or mark in, the shared bucket.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::metastore::{MetaStore, SyncStats};
use crate::objstore::ObjectStore;

/// Periodically reloads block descriptors and deletion marks
pub struct BucketSyncService {
    metastore: Arc<MetaStore>,
    bucket: Arc<dyn ObjectStore>,
    interval: Duration,
    status: RwLock<ServiceStatus>,
    last_sync: RwLock<Option<SyncStats>>,
}

impl BucketSyncService {
    /// Create a sync service
    pub fn new(metastore: Arc<MetaStore>, bucket: Arc<dyn ObjectStore>, interval: Duration) -> Self {
        Self {
            metastore,
            bucket,
            interval,
            status: RwLock::new(ServiceStatus::Stopped),
            last_sync: RwLock::new(None),
        }
    }

    /// Result of the most recent successful sync
    pub fn last_sync(&self) -> Option<SyncStats> {
        self.last_sync.read().clone()
    }

    async fn sync(&self) {
        match self.metastore.sync_from_bucket(self.bucket.as_ref()).await {
            Ok(stats) => *self.last_sync.write() = Some(stats),
            Err(e) => tracing::error!(bucket = self.bucket.name(), error = %e, "Bucket sync failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for BucketSyncService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Starting;
        // First tick fires immediately; dependents start on a loaded store
        self.sync().await;
        *self.status.write() = ServiceStatus::Running;

        let mut tick = interval(self.interval.max(Duration::from_millis(1)));
        tick.tick().await;

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Bucket sync broadcast receiver lagged");
                        }
                    }
                }
                _ = tick.tick() => self.sync().await,
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Bucket sync service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bucket-sync"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{self, BlockMeta, BlockPayload, BlockSeries};
    use crate::objstore::InMemoryObjectStore;
    use crate::types::{Labels, Sample};

    #[tokio::test]
    async fn test_picks_up_blocks_uploaded_elsewhere() {
        let bucket = Arc::new(InMemoryObjectStore::new());
        let meta = BlockMeta::new_raw(0, 1000, Labels::from_pairs([("replica", "0")]));
        let payload = BlockPayload::Raw(vec![BlockSeries::new(
            Labels::from_pairs([("__name__", "up")]),
            vec![Sample::new(0, 1.0)],
        )]);
        block::write_block(bucket.as_ref(), &meta, &payload).await.unwrap();

        let metastore = Arc::new(MetaStore::new());
        let service = Arc::new(BucketSyncService::new(
            metastore.clone(),
            bucket,
            Duration::from_secs(3600),
        ));
        let (tx, rx) = broadcast::channel(1);
        let runner = service.clone();
        let task = tokio::spawn(async move { runner.start(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(metastore.get(&meta.block_id).is_some());
        assert_eq!(service.last_sync().map(|s| s.loaded), Some(1));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }
}
