//! Per-job dispatch
//!
//! Every fetched job passes through [`JobDispatcher::dispatch`] exactly
//! once: an authoritative cancellation check at entry, a fresh resolution
//! scope, one handler resolution, one invocation, and scope teardown on
//! every exit path. Concurrent dispatches never share a scope, so handlers
//! cannot leak state across jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::broker::{Job, JobOutcome};
use crate::registry::{HandlerProvider, HandlerRegistry};
use crate::scope::{Scope, ScopeFactory};

/// Routes each fetched job to its handler inside an isolated scope
pub struct JobDispatcher {
    scopes: Arc<ScopeFactory>,
    providers: HashMap<String, HandlerProvider>,
}

impl JobDispatcher {
    /// Create a dispatcher wired to the registry's handler providers
    pub fn new(scopes: Arc<ScopeFactory>, registry: &HandlerRegistry) -> Self {
        Self {
            scopes,
            providers: registry.providers(),
        }
    }

    /// Dispatch one job
    ///
    /// If the signal is already cancelled the job is reported
    /// [`JobOutcome::Cancelled`] without resolving a handler: a job never
    /// begins execution after shutdown has been requested. Handler failures
    /// are contained here and surface as [`JobOutcome::Failed`]; they never
    /// propagate to the worker loop.
    #[instrument(skip(self, job, signal), fields(job_type = %job.job_type(), job_key = %job.key()))]
    pub async fn dispatch(&self, job: Job, signal: CancellationToken) -> JobOutcome {
        if signal.is_cancelled() {
            debug!("job arrived after shutdown was requested, reporting cancelled");
            return JobOutcome::Cancelled;
        }

        // One scope per job, released on every exit path; the Drop impl
        // backstops panics inside the handler.
        let scope = self.scopes.create_scope();
        let outcome = self.dispatch_in_scope(&scope, &job, &signal).await;
        scope.release();
        outcome
    }

    async fn dispatch_in_scope(
        &self,
        scope: &Scope,
        job: &Job,
        signal: &CancellationToken,
    ) -> JobOutcome {
        // The pool only opens workers for registered job types, so a miss
        // here means the dispatcher was wired by hand against the wrong
        // registry. Contain it at the job boundary anyway.
        let provider = match self.providers.get(job.job_type()) {
            Some(provider) => Arc::clone(provider),
            None => {
                error!("no handler wired for job type");
                return JobOutcome::Failed(format!(
                    "no handler wired for job type '{}'",
                    job.job_type()
                ));
            }
        };

        let handler = match provider(scope) {
            Ok(handler) => handler,
            Err(e) => {
                error!(error = %e, "failed to resolve handler from job scope");
                return JobOutcome::Failed(e.to_string());
            }
        };

        match handler.handle(job, signal).await {
            Ok(()) => JobOutcome::Completed,
            Err(e) => {
                warn!(error = %e, retryable = e.retryable, "job handler failed");
                JobOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerDescriptor, HandlerError, JobHandler};
    use crate::scope::ScopeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(
            &self,
            _job: &Job,
            _signal: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::retryable("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher_with_counter(
        job_type: &str,
        fail: bool,
    ) -> (JobDispatcher, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let resolutions = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        let resolutions_in = Arc::clone(&resolutions);
        let calls_in = Arc::clone(&calls);
        registry.register(HandlerDescriptor::new(job_type), move |_scope| {
            resolutions_in.fetch_add(1, Ordering::SeqCst);
            Ok(RecordingHandler {
                calls: Arc::clone(&calls_in),
                fail,
            })
        });

        let dispatcher = JobDispatcher::new(Arc::new(ScopeFactory::new()), &registry);
        (dispatcher, resolutions, calls)
    }

    #[tokio::test]
    async fn test_successful_dispatch_completes() {
        let (dispatcher, resolutions, calls) = dispatcher_with_counter("a", false);
        let job = Job::new("a", serde_json::json!({}));

        let outcome = dispatcher.dispatch(job, CancellationToken::new()).await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained() {
        let (dispatcher, _, calls) = dispatcher_with_counter("a", true);
        let job = Job::new("a", serde_json::json!({}));

        let outcome = dispatcher.dispatch(job, CancellationToken::new()).await;

        assert_eq!(outcome, JobOutcome::Failed("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_signal_skips_handler_resolution() {
        let (dispatcher, resolutions, calls) = dispatcher_with_counter("a", false);
        let signal = CancellationToken::new();
        signal.cancel();

        let outcome = dispatcher
            .dispatch(Job::new("a", serde_json::json!({})), signal)
            .await;

        assert_eq!(outcome, JobOutcome::Cancelled);
        assert_eq!(resolutions.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unwired_job_type_fails_the_job_only() {
        let (dispatcher, _, _) = dispatcher_with_counter("a", false);

        let outcome = dispatcher
            .dispatch(
                Job::new("unknown", serde_json::json!({})),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, JobOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_provider_error_fails_the_job() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerDescriptor::new("a"), |_scope| {
            Err::<RecordingHandler, _>(ScopeError::NotProvided("missing dependency"))
        });
        let dispatcher = JobDispatcher::new(Arc::new(ScopeFactory::new()), &registry);

        let outcome = dispatcher
            .dispatch(Job::new("a", serde_json::json!({})), CancellationToken::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_get_distinct_released_scopes() {
        struct ScopedDep {
            dropped: Arc<AtomicUsize>,
        }

        impl Drop for ScopedDep {
            fn drop(&mut self) {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }

        struct ScopedHandler {
            dep: Arc<ScopedDep>,
            fail: bool,
        }

        #[async_trait]
        impl JobHandler for ScopedHandler {
            async fn handle(
                &self,
                _job: &Job,
                _signal: &CancellationToken,
            ) -> Result<(), HandlerError> {
                let _ = &self.dep;
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if self.fail {
                    Err(HandlerError::non_retryable("one of the two fails"))
                } else {
                    Ok(())
                }
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_in = Arc::clone(&dropped);
        let mut scopes = ScopeFactory::new();
        scopes.provide(move || ScopedDep {
            dropped: Arc::clone(&dropped_in),
        });

        let seen_scope_ids: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
        let fail_next = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        let seen = Arc::clone(&seen_scope_ids);
        let fail_next_in = Arc::clone(&fail_next);
        registry.register(HandlerDescriptor::new("a"), move |scope| {
            seen.lock().unwrap().push(scope.id());
            Ok(ScopedHandler {
                dep: scope.resolve::<ScopedDep>()?,
                fail: fail_next_in.fetch_add(1, Ordering::SeqCst) == 0,
            })
        });

        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(scopes), &registry));
        let signal = CancellationToken::new();

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            let signal = signal.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(Job::new("a", serde_json::json!({})), signal)
                    .await
            })
        };
        let second = {
            let dispatcher = Arc::clone(&dispatcher);
            let signal = signal.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(Job::new("a", serde_json::json!({})), signal)
                    .await
            })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());

        // One failed, one completed; both ran
        assert!(matches!(first, JobOutcome::Completed | JobOutcome::Failed(_)));
        assert!(matches!(second, JobOutcome::Completed | JobOutcome::Failed(_)));
        assert_ne!(first == JobOutcome::Completed, second == JobOutcome::Completed);

        // Each dispatch got its own scope
        let ids = seen_scope_ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        // Both scopes were released: the scoped instance of each dispatch is
        // dropped, the failed handler's included
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
