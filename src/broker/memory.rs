//! In-memory job broker
//!
//! A complete in-process [`JobBroker`] used by the integration tests and
//! for local development. Each opened worker runs a real polling loop:
//! jobs are fetched from a per-type queue at the configured poll interval,
//! `max_jobs_active` is enforced with a semaphore, and the loop stops
//! fetching as soon as the pool's cancellation signal fires or the handle
//! is closed.
//!
//! Lease expiry (`job_timeout`) and fetch-variable projection are not
//! modelled: enqueued jobs carry their full payload and are delivered at
//! most once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{BrokerError, Job, JobBroker, JobCallback, JobOutcome, WorkerHandle};
use crate::config::WorkerConfig;

/// In-memory broker with one queue per job type
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, VecDeque<Job>>>>,
    opened_configs: Mutex<Vec<WorkerConfig>>,
    open_workers: Arc<AtomicUsize>,
    closed_workers: Arc<AtomicUsize>,
    outcomes: Arc<Mutex<Vec<(Uuid, JobOutcome)>>>,
}

impl InMemoryBroker {
    /// Create a new broker with no queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job for delivery to the worker polling its type
    pub fn enqueue(&self, job: Job) {
        self.queues
            .lock()
            .unwrap()
            .entry(job.job_type().to_string())
            .or_default()
            .push_back(job);
    }

    /// Number of jobs still queued for a job type
    pub fn queued(&self, job_type: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(job_type)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Configurations of every worker ever opened, in open order
    pub fn opened_configs(&self) -> Vec<WorkerConfig> {
        self.opened_configs.lock().unwrap().clone()
    }

    /// Number of currently open workers
    pub fn open_worker_count(&self) -> usize {
        self.open_workers.load(Ordering::SeqCst)
    }

    /// Number of workers closed so far
    pub fn closed_worker_count(&self) -> usize {
        self.closed_workers.load(Ordering::SeqCst)
    }

    /// Outcomes reported for dispatched jobs, in completion order
    pub fn outcomes(&self) -> Vec<(Uuid, JobOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Outcome reported for one job, if it was dispatched
    pub fn outcome_of(&self, key: Uuid) -> Option<JobOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, outcome)| outcome.clone())
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn open_worker(
        &self,
        config: &WorkerConfig,
        signal: CancellationToken,
        on_job: JobCallback,
    ) -> Result<Box<dyn WorkerHandle>, BrokerError> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let job_type = config.job_type().to_string();
        let poll_interval = config.poll_interval();
        let permits = Arc::new(Semaphore::new(config.max_jobs_active()));
        let queues = Arc::clone(&self.queues);
        let outcomes = Arc::clone(&self.outcomes);

        self.opened_configs.lock().unwrap().push(config.clone());
        self.open_workers.fetch_add(1, Ordering::SeqCst);

        let loop_job_type = job_type.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = signal.cancelled() => {
                        debug!(job_type = %loop_job_type, "worker loop: pool cancellation observed");
                        break;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(job_type = %loop_job_type, "worker loop: handle closed");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                // Drain the queue up to the active-job bound; each in-flight
                // job holds one permit until its callback returns.
                loop {
                    let permit = match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let job = queues
                        .lock()
                        .unwrap()
                        .get_mut(&loop_job_type)
                        .and_then(|queue| queue.pop_front());

                    let Some(job) = job else {
                        break;
                    };

                    let key = job.key();
                    let callback = on_job(job, signal.clone());
                    let outcomes = Arc::clone(&outcomes);
                    tokio::spawn(async move {
                        let outcome = callback.await;
                        outcomes.lock().unwrap().push((key, outcome));
                        drop(permit);
                    });
                }
            }

            debug!(job_type = %loop_job_type, "worker loop exited");
        });

        Ok(Box::new(MemoryWorkerHandle {
            job_type,
            shutdown_tx,
            join: Some(join),
            closed: false,
            open_workers: Arc::clone(&self.open_workers),
            closed_workers: Arc::clone(&self.closed_workers),
        }))
    }
}

struct MemoryWorkerHandle {
    job_type: String,
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    closed: bool,
    open_workers: Arc<AtomicUsize>,
    closed_workers: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerHandle for MemoryWorkerHandle {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.shutdown_tx.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }

        self.open_workers.fetch_sub(1, Ordering::SeqCst);
        self.closed_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MemoryWorkerHandle {
    fn drop(&mut self) {
        // Best-effort: a handle dropped without close() still stops its loop.
        if !self.closed {
            self.closed = true;
            let _ = self.shutdown_tx.send(true);
            self.open_workers.fetch_sub(1, Ordering::SeqCst);
            self.closed_workers.fetch_add(1, Ordering::SeqCst);
        }
    }
}
