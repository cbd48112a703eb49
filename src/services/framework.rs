//! Service Framework
//!
//! Long-running background loops (bucket sync, compaction) implement
//! [`Service`] and are driven by a [`ServiceManager`], which starts them in
//! dependency order and stops them through one broadcast shutdown signal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background loop with a graceful shutdown
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;

    /// Services that must be running before this one starts
    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Initializing
    Starting,
    /// Running normally
    Running,
    /// Shutting down
    Stopping,
    /// Stopped
    Stopped,
    /// Stopped with an error
    Failed(String),
}

impl ServiceStatus {
    /// Running normally
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Stopped, cleanly or not
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors raised by services and the manager
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Failed before entering the main loop
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    /// Failed inside the main loop
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// Missing or circular dependency
    #[error("Dependency not satisfied: {0}")]
    DependencyError(String),

    /// Service registered or started twice
    #[error("Service already running")]
    AlreadyRunning,

    /// No service with this name
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Manager
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Time granted to all services to stop after the shutdown signal
    /// Default: 30 seconds
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    started_at: Option<Instant>,
}

/// Starts, tracks and stops registered services
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning);
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                started_at: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Start every registered service, dependencies first
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }

        let order = match self.start_order() {
            Ok(order) => order,
            Err(e) => {
                *self.running.write() = false;
                return Err(e);
            },
        };
        for name in order {
            self.start_service(name).await?;
        }
        tracing::info!("All services started");
        Ok(())
    }

    async fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut services = self.services.write();
            let handle = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            let service = handle.service.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let runner = service.clone();
            handle.task = Some(tokio::spawn(async move { runner.start(shutdown_rx).await }));
            handle.started_at = Some(Instant::now());
            service
        };

        // Give the loop a moment to come up before starting dependents
        let waited = Instant::now();
        while waited.elapsed() < Duration::from_millis(100) && !service.status().is_healthy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracing::debug!(service = name, status = ?service.status(), "Service started");
        Ok(())
    }

    /// Signal shutdown and wait for every service to stop
    pub async fn shutdown(&self) {
        tracing::info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped gracefully"),
                Ok(Ok(Err(e))) => tracing::warn!(service = name, error = %e, "Service stopped with error"),
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Time since a service was started
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        self.services
            .read()
            .get(name)
            .and_then(|h| h.started_at.map(|started| started.elapsed()))
    }

    /// All services running normally
    pub fn is_healthy(&self) -> bool {
        self.services.read().values().all(|h| h.service.status().is_healthy())
    }

    /// Depth-first ordering so every service comes after its dependencies
    fn start_order(&self) -> Result<Vec<&'static str>, ServiceError> {
        let services = self.services.read();
        let mut names: Vec<&'static str> = services.keys().copied().collect();
        names.sort_unstable();

        let mut order = Vec::with_capacity(names.len());
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();

        fn visit(
            name: &'static str,
            services: &HashMap<&'static str, ServiceHandle>,
            done: &mut HashSet<&'static str>,
            visiting: &mut HashSet<&'static str>,
            order: &mut Vec<&'static str>,
        ) -> Result<(), ServiceError> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(ServiceError::DependencyError(format!(
                    "circular dependency at '{}'",
                    name
                )));
            }
            let handle = services.get(name).ok_or_else(|| {
                ServiceError::DependencyError(format!("'{}' is not registered", name))
            })?;
            for dep in handle.service.dependencies() {
                visit(dep, services, done, visiting, order)?;
            }
            visiting.remove(name);
            done.insert(name);
            order.push(name);
            Ok(())
        }

        for name in names {
            visit(name, &services, &mut done, &mut visiting, &mut order)?;
        }
        Ok(order)
    }
}
