//! Broker collaborator interface
//!
//! The pool depends only on this contract. Transport (gRPC or HTTP), job
//! leasing, fetch batching and retry mechanics all live behind
//! [`JobBroker`]; the core supplies the per-job callback and the bounding
//! configuration, nothing more.
//!
//! [`memory::InMemoryBroker`] is a complete in-process implementation with
//! real polling loops, used by the integration tests and handy for local
//! development.

mod memory;

pub use memory::InMemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;

/// One unit of work fetched from the broker
///
/// The broker owns the job; the core holds it only for the duration of one
/// dispatch and never persists it beyond the handling call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    key: Uuid,
    job_type: String,
    variables: serde_json::Value,
}

impl Job {
    /// Create a job with a generated key
    pub fn new(job_type: impl Into<String>, variables: serde_json::Value) -> Self {
        Self {
            key: Uuid::now_v7(),
            job_type: job_type.into(),
            variables,
        }
    }

    /// Unique key of this job
    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Job type used to route this job to its worker
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// All payload variables
    pub fn variables(&self) -> &serde_json::Value {
        &self.variables
    }

    /// Look up a single payload variable
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }
}

/// Outcome of one dispatched job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler returned successfully
    Completed,
    /// The handler failed; the message describes the failure
    Failed(String),
    /// The job arrived after shutdown was requested and was never handled
    Cancelled,
}

/// Per-job callback supplied by the pool
///
/// The broker's polling loop invokes this once for every fetched job,
/// passing the pool-wide cancellation signal along.
pub type JobCallback =
    Arc<dyn Fn(Job, CancellationToken) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Opening a polling worker failed
    #[error("failed to open worker for job type '{job_type}': {reason}")]
    OpenWorker {
        /// Job type the worker was meant to poll
        job_type: String,
        /// What went wrong
        reason: String,
    },

    /// The broker cannot be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// The job broker, consumed as an abstract capability
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Open one polling worker for the configured job type
    ///
    /// The worker continuously fetches jobs within the config's bounds
    /// (`max_jobs_active`, `poll_interval`, `poll_timeout`, `job_timeout`)
    /// and invokes `on_job` for each, forwarding `signal`. Once `signal` is
    /// cancelled the worker stops requesting new jobs.
    async fn open_worker(
        &self,
        config: &WorkerConfig,
        signal: CancellationToken,
        on_job: JobCallback,
    ) -> Result<Box<dyn WorkerHandle>, BrokerError>;
}

/// An open polling worker
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Job type this worker polls
    fn job_type(&self) -> &str;

    /// Stop the worker's polling loop and wait for it to exit
    ///
    /// Idempotent: closing an already-closed handle is a no-op.
    async fn close(&mut self);

    /// Check if this handle has been closed
    fn is_closed(&self) -> bool;
}
