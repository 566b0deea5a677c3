//! Worker pool: bounded set of tokio tasks draining the job queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskflow_core::TaskStatus;

use super::projector::StatusProjector;
use super::work::WorkFn;
use crate::jobs::{AttemptFailure, Delivery, JobQueue, QueueError, QueueEvent};
use crate::task_store::{TaskStore, TaskStoreError};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of jobs processed in parallel
    pub concurrency: usize,
    /// Cooperative pause before each work step
    pub step_pause: Duration,
    /// Lease renewal period while a step runs; keep it below the queue's
    /// visibility timeout
    pub lease_renewal: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            step_pause: Duration::from_secs(2),
            lease_renewal: Duration::from_secs(15),
            name: "task-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_step_pause(mut self, pause: Duration) -> Self {
        self.step_pause = pause;
        self
    }

    pub fn with_lease_renewal(mut self, period: Duration) -> Self {
        self.lease_renewal = period.max(Duration::from_millis(1));
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Attempts that ended in a failure (retried or exhausted)
    pub jobs_failed: u64,
    /// Deliveries dropped because a newer attempt or lease owns the job
    pub jobs_abandoned: u64,
    pub current_running: usize,
}

/// Pause after a queue error before dequeuing again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed-size pool of workers sharing one queue and one task store.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    projector: StatusProjector,
    work: Arc<dyn WorkFn>,
    config: WorkerPoolConfig,
    events: broadcast::Sender<QueueEvent>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn JobQueue>,
        work: Arc<dyn WorkFn>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            queue,
            projector: StatusProjector::new(store),
            work,
            config,
            events,
        }
    }

    /// Receive every queue outcome produced by this pool.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Start `concurrency` workers.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let events = self.events.clone();
        let pool = Arc::new(self);

        let joins = (0..pool.config.concurrency)
            .map(|worker| {
                let pool = pool.clone();
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown, stats).await })
            })
            .collect();

        info!(pool = %pool.config.name, concurrency = pool.config.concurrency, "worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            events,
        }
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<PoolStats>>) {
        debug!(pool = %self.config.name, worker, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = self.queue.dequeue() => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(QueueError::Closed) => break,
                Err(e) => {
                    error!(pool = %self.config.name, worker, error = %e, "failed to dequeue job");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            record(&stats, |s| s.current_running += 1);
            let outcome = self.process(&delivery).await;
            record(&stats, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match &outcome {
                    Ok(Some(QueueEvent::Completed { .. })) => s.jobs_succeeded += 1,
                    Ok(Some(_)) => s.jobs_failed += 1,
                    Ok(None) => s.jobs_abandoned += 1,
                    Err(_) => s.jobs_failed += 1,
                }
            });

            if let Err(e) = outcome {
                error!(
                    pool = %self.config.name,
                    job_id = %delivery.job_id(),
                    error = %e,
                    "failed to settle job with the queue"
                );
            }
        }

        debug!(pool = %self.config.name, worker, "worker stopped");
    }

    /// Run one delivery to completion and settle it with the queue.
    ///
    /// Returns `None` when the delivery was abandoned because a newer attempt
    /// (or a newer lease) owns the job.
    pub async fn process(&self, delivery: &Delivery) -> Result<Option<QueueEvent>, QueueError> {
        let job = &delivery.job;
        let task_id = job.task_id();
        let attempt = job.attempt;

        info!(job_id = %job.id, %task_id, attempt, "processing job");

        // A worker that died between its `failed` write and the nack leaves
        // a redelivery behind; settle it instead of opening another attempt.
        if let Ok(task) = self.projector.current(task_id).await {
            if task.status == TaskStatus::Failed && !job.options.retry.decide(task.retries).retry {
                warn!(job_id = %job.id, %task_id, attempt, retries = task.retries, "retry budget already spent; failing redelivery");
                let error = task.error.unwrap_or_else(|| "retry budget exhausted".to_string());
                let failure = AttemptFailure::new(error, task.retries);
                return self.settle(self.queue.nack(delivery, &failure).await);
            }
        }

        match self.projector.start_attempt(task_id, attempt).await {
            Ok(_) => {}
            Err(TaskStoreError::StaleAttempt { current, .. }) => {
                warn!(job_id = %job.id, %task_id, attempt, current, "newer attempt owns the task; abandoning delivery");
                return Ok(None);
            }
            Err(TaskStoreError::InvalidTransition {
                from: TaskStatus::Completed,
                ..
            }) => {
                info!(job_id = %job.id, %task_id, "task already completed; acknowledging redelivery");
                return self.settle(self.queue.ack(delivery).await);
            }
            Err(TaskStoreError::NotFound(_)) => {
                error!(job_id = %job.id, %task_id, "task record missing; failing job");
                let failure = AttemptFailure::terminal(format!("task {task_id} not found"), job);
                return self.settle(self.queue.nack(delivery, &failure).await);
            }
            Err(e) => {
                error!(job_id = %job.id, %task_id, error = %e, "could not start attempt");
                let failure = AttemptFailure::new(e.to_string(), attempt);
                return self.settle(self.queue.nack(delivery, &failure).await);
            }
        }

        let steps = self.work.step_count(&job.payload);
        for step in 1..=steps {
            let step_run = self.with_lease(delivery, async {
                tokio::time::sleep(self.config.step_pause).await;
                self.work.run_step(&job.payload, step).await
            });
            let raw = match step_run.await {
                None => return Ok(self.abandon(delivery)),
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return self.fail(delivery, e.to_string()).await,
            };

            match self.projector.progress(task_id, attempt, raw).await {
                Ok(_) => {}
                Err(TaskStoreError::StaleAttempt { .. }) => return Ok(self.abandon(delivery)),
                Err(e) => return self.fail(delivery, format!("progress update failed: {e}")).await,
            }

            match self.queue.touch(delivery).await {
                Ok(()) => {}
                Err(QueueError::LeaseLost(_)) => return Ok(self.abandon(delivery)),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to extend lease"),
            }
        }

        let result = match self.with_lease(delivery, self.work.finish(&job.payload)).await {
            None => return Ok(self.abandon(delivery)),
            Some(Ok(result)) => result,
            Some(Err(e)) => return self.fail(delivery, e.to_string()).await,
        };

        match self.projector.complete(task_id, attempt, result).await {
            Ok(_) => {}
            Err(TaskStoreError::StaleAttempt { .. }) => return Ok(self.abandon(delivery)),
            Err(e) => return self.fail(delivery, format!("completion update failed: {e}")).await,
        }

        info!(job_id = %job.id, %task_id, attempt, "task completed");
        self.settle(self.queue.ack(delivery).await)
    }

    /// Drive `work` while renewing the lease every `lease_renewal`.
    ///
    /// Returns `None` (dropping `work`) once the queue reports the lease lost.
    async fn with_lease<F: Future>(&self, delivery: &Delivery, work: F) -> Option<F::Output> {
        let period = self.config.lease_renewal.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return Some(output),
                _ = heartbeat.tick() => match self.queue.touch(delivery).await {
                    Ok(()) => debug!(job_id = %delivery.job_id(), "lease renewed"),
                    Err(QueueError::LeaseLost(_)) => return None,
                    Err(e) => warn!(job_id = %delivery.job_id(), error = %e, "failed to renew lease"),
                },
            }
        }
    }

    async fn fail(&self, delivery: &Delivery, error: String) -> Result<Option<QueueEvent>, QueueError> {
        let job = &delivery.job;
        let task_id = job.task_id();
        warn!(job_id = %job.id, %task_id, attempt = job.attempt, error = %error, "attempt failed");

        let failure = match self.projector.fail(task_id, job.attempt, &error).await {
            Ok(task) => AttemptFailure::new(error, task.retries),
            Err(TaskStoreError::StaleAttempt { .. }) => return Ok(self.abandon(delivery)),
            Err(TaskStoreError::NotFound(_)) => AttemptFailure::terminal(error, job),
            Err(e) => {
                error!(job_id = %job.id, %task_id, error = %e, "could not record failure; using delivery attempt");
                AttemptFailure::new(error, job.attempt)
            }
        };

        self.settle(self.queue.nack(delivery, &failure).await)
    }

    fn abandon(&self, delivery: &Delivery) -> Option<QueueEvent> {
        warn!(job_id = %delivery.job_id(), attempt = delivery.attempt(), "delivery superseded; abandoning");
        None
    }

    fn settle(&self, outcome: Result<QueueEvent, QueueError>) -> Result<Option<QueueEvent>, QueueError> {
        match outcome {
            Ok(event) => {
                // No subscribers is fine.
                let _ = self.events.send(event.clone());
                Ok(Some(event))
            }
            Err(QueueError::LeaseLost(job_id)) => {
                warn!(%job_id, "lease lost before settling; the job will be redelivered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn record(stats: &Mutex<PoolStats>, f: impl FnOnce(&mut PoolStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    events: broadcast::Sender<QueueEvent>,
}

impl WorkerPoolHandle {
    /// Stop dequeuing and wait for in-flight jobs to finish.
    ///
    /// Returns the final statistics.
    pub async fn shutdown(self) -> PoolStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
        let stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        info!(processed = stats.jobs_processed, "worker pool stopped");
        stats
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
