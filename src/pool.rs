//! Worker pool lifecycle
//!
//! The [`WorkerPool`] owns the set of running worker loops. On start it
//! resolves one validated [`WorkerConfig`] per registered job type (all of
//! them, before the first broker call, so a single bad entry rejects the
//! whole pool), acquires its pool-lifetime resolution scope, resolves the
//! broker client from it and opens one polling loop per job type, each
//! wired to the [`JobDispatcher`] with the pool-wide cancellation signal.
//!
//! Shutdown flows top-down: the pool cancels its signal first, so loops
//! stop fetching and in-flight dispatches observe cancellation, then the
//! worker handles are closed and the pool scope is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerError, JobBroker, JobCallback, WorkerHandle};
use crate::config::{ConfigError, WorkerConfig, WorkerDefaults};
use crate::dispatch::JobDispatcher;
use crate::registry::HandlerRegistry;
use crate::scope::{Scope, ScopeError, ScopeFactory};

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// No workers are open
    Stopped,
    /// Configurations are being resolved and workers opened
    Starting,
    /// All workers are open and polling
    Running,
    /// Cancellation has been signalled and workers are closing
    Stopping,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is not in the stopped state
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scope resolution error (an absent collaborator, e.g. no broker
    /// client provided to the scope factory)
    #[error("scope error: {0}")]
    Scope(#[from] ScopeError),

    /// Broker error
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Pool of job workers, one polling loop per registered job type
///
/// Start and stop are not defended against concurrent callers: the host
/// owns the lifecycle and serializes transitions, the same contract as a
/// managed service.
///
/// # Example
///
/// ```ignore
/// let mut scopes = ScopeFactory::new();
/// scopes.provide_shared::<dyn JobBroker>(broker);
///
/// let mut registry = HandlerRegistry::new();
/// registry.register(
///     HandlerDescriptor::new("ship_order").with_fetch_variables(["order_id"]),
///     |_scope| Ok(ShipOrderHandler),
/// );
///
/// let defaults = WorkerDefaults::new()
///     .with_max_jobs_active(3)
///     .with_poll_interval(Duration::from_millis(100))
///     .with_poll_timeout(Duration::from_secs(10))
///     .with_job_timeout(Duration::from_secs(5));
///
/// let pool = WorkerPool::new(registry, defaults, scopes);
/// pool.start(&shutdown_token).await?;
/// // ...
/// pool.stop().await;
/// ```
pub struct WorkerPool {
    registry: HandlerRegistry,
    defaults: WorkerDefaults,
    scopes: Arc<ScopeFactory>,
    status: RwLock<PoolStatus>,
    workers: Mutex<HashMap<String, Box<dyn WorkerHandle>>>,
    pool_scope: Mutex<Option<Scope>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl WorkerPool {
    /// Create a new worker pool
    ///
    /// The scope factory must provide the `dyn JobBroker` client; the pool
    /// resolves it from its own scope at start, the same path handlers use
    /// for their dependencies.
    pub fn new(registry: HandlerRegistry, defaults: WorkerDefaults, scopes: ScopeFactory) -> Self {
        Self {
            registry,
            defaults,
            scopes: Arc::new(scopes),
            status: RwLock::new(PoolStatus::Stopped),
            workers: Mutex::new(HashMap::new()),
            pool_scope: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Start the pool
    ///
    /// Creates the pool-wide cancellation signal as a child of `signal`,
    /// resolves and validates every worker configuration, then opens one
    /// polling loop per job type. Any configuration violation or open
    /// failure aborts the whole start: no partial pool is ever left
    /// running.
    #[instrument(skip(self, signal))]
    pub async fn start(&self, signal: &CancellationToken) -> Result<(), PoolError> {
        {
            let mut status = self.status.write().unwrap();
            if *status != PoolStatus::Stopped {
                return Err(PoolError::AlreadyRunning);
            }
            *status = PoolStatus::Starting;
        }

        match self.open_all(signal).await {
            Ok(()) => {
                *self.status.write().unwrap() = PoolStatus::Running;
                Ok(())
            }
            Err(e) => {
                *self.status.write().unwrap() = PoolStatus::Stopped;
                Err(e)
            }
        }
    }

    async fn open_all(&self, signal: &CancellationToken) -> Result<(), PoolError> {
        // Fail fast: every configuration is resolved and validated before
        // the first call to the broker.
        let mut configs = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.descriptors() {
            configs.push(WorkerConfig::resolve(&self.defaults, descriptor)?);
        }

        let cancel = signal.child_token();
        let pool_scope = self.scopes.create_scope();
        let broker = match pool_scope.resolve::<dyn JobBroker>() {
            Ok(broker) => broker,
            Err(e) => {
                pool_scope.release();
                return Err(e.into());
            }
        };

        let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(&self.scopes), &self.registry));

        let mut handles: HashMap<String, Box<dyn WorkerHandle>> = HashMap::new();
        for config in configs {
            let dispatcher = Arc::clone(&dispatcher);
            let on_job: JobCallback = Arc::new(move |job, job_signal| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { dispatcher.dispatch(job, job_signal).await })
            });

            match broker.open_worker(&config, cancel.clone(), on_job).await {
                Ok(handle) => {
                    info!(
                        job_type = %config.job_type(),
                        worker_name = ?config.worker_name(),
                        max_jobs_active = config.max_jobs_active(),
                        "opened job worker"
                    );
                    handles.insert(config.job_type().to_string(), handle);
                }
                Err(e) => {
                    warn!(
                        job_type = %config.job_type(),
                        error = %e,
                        "failed to open job worker, tearing down the partial pool"
                    );
                    cancel.cancel();
                    for (_, mut handle) in handles {
                        handle.close().await;
                    }
                    pool_scope.release();
                    return Err(e.into());
                }
            }
        }

        info!(count = handles.len(), "worker pool started");

        *self.workers.lock().unwrap() = handles;
        *self.pool_scope.lock().unwrap() = Some(pool_scope);
        *self.cancel.lock().unwrap() = Some(cancel);
        Ok(())
    }

    /// Stop the pool
    ///
    /// Cancels the pool-wide signal first, then closes every worker handle
    /// and releases the pool scope. Idempotent, safe after a failed start
    /// (it only releases what was actually acquired), and best-effort: stop
    /// runs during process shutdown where nobody can act on further errors.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        {
            let mut status = self.status.write().unwrap();
            if *status == PoolStatus::Stopped {
                debug!("stop on a stopped pool is a no-op");
                return;
            }
            *status = PoolStatus::Stopping;
        }

        // Cancellation is signalled before any resource release so loops
        // stop fetching and in-flight dispatches observe it.
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }

        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for (job_type, mut handle) in handles {
            handle.close().await;
            debug!(%job_type, "closed job worker");
        }

        if let Some(scope) = self.pool_scope.lock().unwrap().take() {
            scope.release();
        }

        *self.status.write().unwrap() = PoolStatus::Stopped;
        info!("worker pool stopped");
    }

    /// Get the current status
    pub fn status(&self) -> PoolStatus {
        *self.status.read().unwrap()
    }

    /// Number of currently open workers
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}
