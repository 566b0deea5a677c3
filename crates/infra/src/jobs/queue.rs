//! Job queue abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::types::{AttemptFailure, Job, JobId, JobOptions, QueueEvent, QueueStats, TaskPayload};

/// A job claimed by one worker.
///
/// The `receipt` identifies this particular lease: once the visibility
/// timeout reclaims the job, acknowledgements carrying the old receipt fail
/// with [`QueueError::LeaseLost`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: Job,
    pub receipt: Uuid,
}

impl Delivery {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }
}

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("lease lost for job {0} (reclaimed after visibility timeout)")]
    LeaseLost(JobId),
    #[error("queue closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Durable, delay-aware, at-least-once job queue.
///
/// Contract:
/// - `enqueue` returns once the job is persisted; it becomes deliverable after
///   `options.initial_delay`
/// - `dequeue` waits until a job is eligible and leases it to one caller
/// - a lease that is neither acked nor nacked within the visibility timeout is
///   reclaimed and the job redelivered with `attempt + 1`, at most
///   `max_stalled` times; after that the job is dead-lettered
/// - `nack` consults the job's retry policy with the reported failure count
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: TaskPayload, options: JobOptions) -> Result<Job, QueueError>;

    async fn dequeue(&self) -> Result<Delivery, QueueError>;

    /// Extend the lease of an in-flight delivery.
    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Report success; the job is discarded.
    async fn ack(&self, delivery: &Delivery) -> Result<QueueEvent, QueueError>;

    /// Report failure; the job is rescheduled or discarded per its policy.
    async fn nack(&self, delivery: &Delivery, failure: &AttemptFailure) -> Result<QueueEvent, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, payload: TaskPayload, options: JobOptions) -> Result<Job, QueueError> {
        (**self).enqueue(payload, options).await
    }

    async fn dequeue(&self) -> Result<Delivery, QueueError> {
        (**self).dequeue().await
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).touch(delivery).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<QueueEvent, QueueError> {
        (**self).ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, failure: &AttemptFailure) -> Result<QueueEvent, QueueError> {
        (**self).nack(delivery, failure).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}

/// Queue-level settings shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a lease stays valid without `touch`/`ack`/`nack`
    pub visibility_timeout: std::time::Duration,
    /// How often polling backends look for eligible jobs
    pub poll_interval: std::time::Duration,
    /// Key namespace for shared backends
    pub key_prefix: String,
    /// Exhausted jobs kept for inspection
    pub dead_letter_limit: usize,
    /// Lease expiries tolerated per job; one more sends it to the dead letters
    pub max_stalled: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: std::time::Duration::from_secs(30),
            poll_interval: std::time::Duration::from_millis(250),
            key_prefix: "taskflow:jobs".to_string(),
            dead_letter_limit: 1_000,
            max_stalled: 1,
        }
    }
}

/// Map a policy decision to the event reported back to the worker.
pub(crate) fn failure_event(job: &Job, failure: &AttemptFailure) -> QueueEvent {
    let decision = job.options.retry.decide(failure.failures);
    if decision.retry {
        QueueEvent::RetryScheduled {
            job_id: job.id,
            task_id: job.task_id(),
            next_attempt: job.attempt + 1,
            delay: decision.delay,
            error: failure.error.clone(),
        }
    } else {
        QueueEvent::Exhausted {
            job_id: job.id,
            task_id: job.task_id(),
            attempts: job.attempt,
            error: failure.error.clone(),
        }
    }
}
