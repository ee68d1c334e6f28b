//! # Jobmill
//!
//! A worker-pool and per-job dispatch engine for external job brokers.
//! Jobmill runs inside a long-lived process, opens one polling worker per
//! declared job type and routes every fetched job to an
//! application-supplied handler through an isolated, per-job resolution
//! scope.
//!
//! ## Features
//!
//! - **Layered configuration**: per-job-type overrides over process-wide
//!   defaults, validated eagerly so a bad entry rejects the whole pool
//!   before the first broker call
//! - **All-or-nothing lifecycle**: `start` opens every worker or none;
//!   `stop` cancels first, releases second, and is idempotent
//! - **Isolated dispatch**: every job gets a fresh resolution scope, so
//!   concurrent handlers cannot share mutable state
//! - **Cooperative cancellation**: one pool-wide signal, chained from the
//!   host's shutdown token, observed by every loop and every dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (resolves configs, opens one polling loop per job type,    │
//! │   owns the handles and the pool-wide cancellation signal)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      JobBroker                               │
//! │  (polling loops, leases, max_jobs_active bound; external)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ one call per fetched job
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     JobDispatcher                            │
//! │  (cancellation check, fresh scope, resolve handler, invoke) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use jobmill::prelude::*;
//!
//! let mut scopes = ScopeFactory::new();
//! scopes.provide_shared::<dyn JobBroker>(broker);
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     HandlerDescriptor::new("ship_order")
//!         .with_max_jobs_active(5)
//!         .with_fetch_variables(["order_id", "address"]),
//!     |_scope| Ok(ShipOrderHandler),
//! );
//!
//! let defaults = WorkerDefaults::new()
//!     .with_max_jobs_active(3)
//!     .with_poll_interval(Duration::from_millis(100))
//!     .with_poll_timeout(Duration::from_secs(10))
//!     .with_job_timeout(Duration::from_secs(5))
//!     .with_worker_name("order-service");
//!
//! let pool = WorkerPool::new(registry, defaults, scopes);
//! pool.start(&shutdown_token).await?;
//! // ... process runs ...
//! pool.stop().await;
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod pool;
pub mod registry;
pub mod scope;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{
        InMemoryBroker, Job, JobBroker, JobCallback, JobOutcome, WorkerHandle,
    };
    pub use crate::config::{ConfigError, WorkerConfig, WorkerDefaults};
    pub use crate::dispatch::JobDispatcher;
    pub use crate::pool::{PoolError, PoolStatus, WorkerPool};
    pub use crate::registry::{HandlerDescriptor, HandlerError, HandlerRegistry, JobHandler};
    pub use crate::scope::{Scope, ScopeError, ScopeFactory};
}

// Re-export key types at crate root
pub use broker::{BrokerError, InMemoryBroker, Job, JobBroker, JobOutcome, WorkerHandle};
pub use config::{ConfigError, WorkerConfig, WorkerDefaults};
pub use dispatch::JobDispatcher;
pub use pool::{PoolError, PoolStatus, WorkerPool};
pub use registry::{HandlerDescriptor, HandlerError, HandlerRegistry, JobHandler};
pub use scope::{Scope, ScopeError, ScopeFactory};
