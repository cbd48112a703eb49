//! Provider registry and concurrent fan-out

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ProviderInfo, SeriesRequest, StoreClient};
use crate::error::StoreError;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::types::{Resolution, SeriesFragment, SeriesQuery};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct StorePoolConfig {
    /// Maximum provider calls in flight across all queries
    /// Default: 20
    pub max_concurrent_select: usize,

    /// Timeout of a single provider call attempt
    /// Default: 10 seconds
    pub per_provider_timeout: Duration,

    /// Retry policy for transient provider failures
    pub retry: RetryPolicy,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_select: 20,
            per_provider_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

struct Provider {
    info: ProviderInfo,
    client: Arc<dyn StoreClient>,
}

/// One call to issue during fan-out
#[derive(Clone)]
pub struct FanOutTarget {
    /// Client to call
    pub client: Arc<dyn StoreClient>,
    /// Request for this client
    pub request: Arc<SeriesRequest>,
}

impl FanOutTarget {
    /// Target `client` with `request`
    pub fn new(client: Arc<dyn StoreClient>, request: Arc<SeriesRequest>) -> Self {
        Self { client, request }
    }
}

/// Collected outcome of a fan-out
#[derive(Debug, Default)]
pub struct FanOutResult {
    /// Fragments returned by successful calls
    pub fragments: Vec<SeriesFragment>,
    /// Calls that failed after retries
    pub failures: Vec<StoreError>,
    /// Number of calls that succeeded
    pub succeeded: usize,
}

/// Registry of known providers
pub struct StorePool {
    config: StorePoolConfig,
    providers: RwLock<BTreeMap<String, Provider>>,
    semaphore: Arc<Semaphore>,
}

impl StorePool {
    /// Create an empty pool
    pub fn new(config: StorePoolConfig) -> Self {
        let permits = config.max_concurrent_select.max(1);
        Self {
            config,
            providers: RwLock::new(BTreeMap::new()),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &StorePoolConfig {
        &self.config
    }

    /// Add a provider, replacing any earlier registration of the endpoint
    pub fn register_provider(&self, info: ProviderInfo, client: Arc<dyn StoreClient>) {
        info!(
            provider = %info.endpoint,
            label_sets = info.label_sets.len(),
            time_range = %info.time_range,
            "Provider registered"
        );
        self.providers
            .write()
            .insert(info.endpoint.clone(), Provider { info, client });
    }

    /// Remove a provider; returns whether it was known
    pub fn deregister_provider(&self, endpoint: &str) -> bool {
        let removed = self.providers.write().remove(endpoint).is_some();
        if removed {
            info!(provider = %endpoint, "Provider deregistered");
        }
        removed
    }

    /// Advertised metadata of all providers, ordered by endpoint
    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.providers.read().values().map(|p| p.info.clone()).collect()
    }

    /// Providers that may hold data for `query`
    ///
    /// A provider qualifies when one of its label sets is compatible with the
    /// matchers and its time range intersects the query window. Providers
    /// whose finest resolution is coarser than `resolution_ceiling` are only
    /// kept when `auto_downsampling` is enabled.
    pub fn select_providers(
        &self,
        query: &SeriesQuery,
        resolution_ceiling: Resolution,
        auto_downsampling: bool,
    ) -> Vec<Arc<dyn StoreClient>> {
        let window = query.time_range();
        self.providers
            .read()
            .values()
            .filter(|p| {
                if !p.info.time_range.overlaps(&window) {
                    return false;
                }
                if !p.info.matches_labels(&query.matchers) {
                    return false;
                }
                if p.info.min_resolution > resolution_ceiling && !auto_downsampling {
                    debug!(
                        provider = %p.info.endpoint,
                        resolution = %p.info.min_resolution,
                        "Provider excluded: resolution too coarse"
                    );
                    return false;
                }
                true
            })
            .map(|p| Arc::clone(&p.client))
            .collect()
    }

    /// Call every target concurrently
    ///
    /// At most `max_concurrent_select` calls run at once. Each attempt is
    /// bounded by the per-provider timeout and transient failures are retried
    /// with the pool's policy, never past `deadline`. Dropping the returned
    /// future aborts all outstanding calls.
    pub async fn fan_out(&self, targets: Vec<FanOutTarget>, deadline: Instant) -> FanOutResult {
        let mut tasks = JoinSet::new();
        let mut endpoints: HashMap<task::Id, String> = HashMap::with_capacity(targets.len());

        for target in targets {
            let semaphore = Arc::clone(&self.semaphore);
            let policy = self.config.retry.clone();
            let per_call = self.config.per_provider_timeout;

            let endpoint = target.client.endpoint().to_string();
            let task_endpoint = endpoint.clone();
            let handle = tasks.spawn(async move {
                let endpoint = task_endpoint;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(StoreError::Unavailable {
                            endpoint,
                            message: "fan-out gate closed".to_string(),
                        })
                    },
                };

                let result = policy
                    .run("store.series", Some(deadline), StoreError::is_transient, || {
                        let client = Arc::clone(&target.client);
                        let request = Arc::clone(&target.request);
                        let endpoint = endpoint.clone();
                        async move {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            match tokio::time::timeout(per_call.min(remaining), client.series(&request)).await {
                                Ok(result) => result,
                                Err(_) => Err(StoreError::Timeout { endpoint }),
                            }
                        }
                    })
                    .await;

                let outcome = match &result {
                    Ok(_) => "success",
                    Err(StoreError::Timeout { .. }) => "timeout",
                    Err(_) => "error",
                };
                metrics::record_provider_request(&endpoint, outcome);
                result
            });
            endpoints.insert(handle.id(), endpoint);
        }

        let mut out = FanOutResult::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(fragments))) => {
                    out.succeeded += 1;
                    out.fragments.extend(fragments);
                },
                Ok((_, Err(e))) => {
                    warn!(provider = %e.endpoint(), error = %e, "Provider call failed");
                    out.failures.push(e);
                },
                Err(e) => {
                    let endpoint = endpoints
                        .remove(&e.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!(provider = %endpoint, error = %e, "Provider task aborted");
                    metrics::record_provider_request(&endpoint, "error");
                    out.failures.push(StoreError::Unavailable {
                        endpoint,
                        message: e.to_string(),
                    });
                },
            }
        }
        out
    }
}
