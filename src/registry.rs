//! Handler registry
//!
//! The registry declares the set of job types the pool serves. Each entry
//! pairs a [`HandlerDescriptor`] (the per-type configuration overrides and
//! fetch variables) with a provider that resolves the handler instance from
//! a job-scoped [`Scope`]. Because descriptor and provider are registered
//! together, every job type the pool opens a worker for is guaranteed to
//! have a handler.
//!
//! The registry is populated before the pool starts and read-only while it
//! runs; changes require a stop/start cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::broker::Job;
use crate::scope::{Scope, ScopeError};

/// Error type for job handler failures
///
/// A handler failure is contained at the job boundary: it is reported on
/// the broker's failure path for that one job and never tears down the
/// worker loop or the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Whether the broker should retry the job
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Application logic for one job type
///
/// The handler receives the fetched job and the pool-wide cancellation
/// signal. Cancellation is cooperative: a handler already running is not
/// interrupted, it is expected to check the signal at its own boundaries.
/// Reporting the job complete or failed to the broker is the handler's
/// responsibility.
///
/// # Example
///
/// ```ignore
/// struct ShipOrderHandler;
///
/// #[async_trait]
/// impl JobHandler for ShipOrderHandler {
///     async fn handle(&self, job: &Job, signal: &CancellationToken) -> Result<(), HandlerError> {
///         let order_id = job.variable("order_id")
///             .ok_or_else(|| HandlerError::non_retryable("missing order_id"))?;
///         // Ship the order, report completion to the broker...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one job
    async fn handle(&self, job: &Job, signal: &CancellationToken) -> Result<(), HandlerError>;
}

/// Declaration of one job type: configuration overrides and fetch variables
///
/// Any field left `None` falls back to the process-wide
/// [`WorkerDefaults`](crate::config::WorkerDefaults) when the worker
/// configuration is resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    /// Job type this handler serves
    pub job_type: String,

    /// Override for the maximum of concurrently-active jobs
    pub max_jobs_active: Option<usize>,

    /// Override for the poll interval
    #[serde(default, with = "duration_millis_opt")]
    pub poll_interval: Option<Duration>,

    /// Override for the poll timeout
    #[serde(default, with = "duration_millis_opt")]
    pub poll_timeout: Option<Duration>,

    /// Override for the job lease timeout
    #[serde(default, with = "duration_millis_opt")]
    pub job_timeout: Option<Duration>,

    /// Override for the worker display name
    pub worker_name: Option<String>,

    /// Variable names the handler needs fetched with every job
    pub fetch_variables: Vec<String>,
}

impl HandlerDescriptor {
    /// Create a descriptor with no overrides
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Override the maximum of concurrently-active jobs
    pub fn with_max_jobs_active(mut self, max: usize) -> Self {
        self.max_jobs_active = Some(max);
        self
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Override the poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Override the job lease timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Override the worker display name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    /// Set the variables fetched with every job
    pub fn with_fetch_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch_variables = variables.into_iter().map(Into::into).collect();
        self
    }
}

/// Provider resolving a handler instance from a job scope
///
/// Invoked once per dispatched job with that job's fresh scope, so the
/// handler and anything it resolves from the scope live exactly as long as
/// the dispatch.
pub type HandlerProvider =
    Arc<dyn Fn(&Scope) -> Result<Arc<dyn JobHandler>, ScopeError> + Send + Sync>;

struct RegistryEntry {
    descriptor: HandlerDescriptor,
    provider: HandlerProvider,
}

/// Registry of job types and their handler providers
pub struct HandlerRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a job type
    ///
    /// Registering the same job type twice replaces the earlier entry.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = HandlerRegistry::new();
    /// registry.register(
    ///     HandlerDescriptor::new("ship_order").with_max_jobs_active(5),
    ///     |_scope| Ok(ShipOrderHandler),
    /// );
    /// ```
    pub fn register<H, F>(&mut self, descriptor: HandlerDescriptor, provider: F)
    where
        H: JobHandler + 'static,
        F: Fn(&Scope) -> Result<H, ScopeError> + Send + Sync + 'static,
    {
        let erased: HandlerProvider =
            Arc::new(move |scope| Ok(Arc::new(provider(scope)?) as Arc<dyn JobHandler>));
        self.entries.insert(
            descriptor.job_type.clone(),
            RegistryEntry {
                descriptor,
                provider: erased,
            },
        );
    }

    /// Check if a job type is registered
    pub fn contains(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    /// Iterate over the registered descriptors
    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    /// Get the handler provider for a job type
    pub fn provider(&self, job_type: &str) -> Option<HandlerProvider> {
        self.entries
            .get(job_type)
            .map(|entry| Arc::clone(&entry.provider))
    }

    /// Snapshot of all providers keyed by job type
    pub(crate) fn providers(&self) -> HashMap<String, HandlerProvider> {
        self.entries
            .iter()
            .map(|(job_type, entry)| (job_type.clone(), Arc::clone(&entry.provider)))
            .collect()
    }

    /// Get the number of registered job types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get all registered job type names
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Serde support for Option<Duration> as milliseconds
mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
