//! Core job types and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskflow_core::TaskId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the work to perform, taken when the job is enqueued.
///
/// The queue only carries this; it never reads or writes the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(n-1)
    #[default]
    Exponential,
    /// Linear backoff: base * n
    Linear,
}

/// Retry policy configuration.
///
/// Pure: the same failure count always yields the same decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total execution attempts allowed (including the first one)
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Growth factor per attempt for `Exponential`
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            multiplier: 2.0,
        }
    }
}

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Delay before the next delivery; zero when `retry` is false.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy that runs the job exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            multiplier: 1.0,
        }
    }

    /// Create a policy with exponential (doubling) backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            multiplier: 2.0,
        }
    }

    /// Calculate delay after the `failures`-th failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = self.multiplier.max(1.0).powi((failures - 1) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (failures as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `failures` failed ones.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    pub fn decide(&self, failures: u32) -> RetryDecision {
        if self.should_retry(failures) {
            RetryDecision {
                retry: true,
                delay: self.delay_for_attempt(failures),
            }
        } else {
            RetryDecision {
                retry: false,
                delay: Duration::ZERO,
            }
        }
    }
}

/// Scheduling options supplied at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the first delivery
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: TaskPayload,
    pub options: JobOptions,
    /// Delivery attempt (1-based); bumped by the queue on every redelivery
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Error reported by the previous failed attempt
    pub last_error: Option<String>,
    /// Leases that expired without an ack or nack
    #[serde(default)]
    pub stalled: u32,
}

impl Job {
    pub fn new(payload: TaskPayload, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            payload,
            options,
            attempt: 1,
            enqueued_at: Utc::now(),
            last_error: None,
            stalled: 0,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.payload.task_id
    }
}

/// Failure report from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub error: String,
    /// Authoritative failure count (the task's `retries` after this failure)
    pub failures: u32,
}

impl AttemptFailure {
    pub fn new(error: impl Into<String>, failures: u32) -> Self {
        Self {
            error: error.into(),
            failures,
        }
    }

    /// A failure that must not be retried, whatever the policy says.
    pub fn terminal(error: impl Into<String>, job: &Job) -> Self {
        Self::new(error, job.options.retry.max_attempts.max(job.attempt))
    }
}

/// Terminal or scheduling outcome of an acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Completed {
        job_id: JobId,
        task_id: TaskId,
        attempt: u32,
    },
    RetryScheduled {
        job_id: JobId,
        task_id: TaskId,
        next_attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
        error: String,
    },
    Exhausted {
        job_id: JobId,
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
}

impl QueueEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            QueueEvent::Completed { task_id, .. }
            | QueueEvent::RetryScheduled { task_id, .. }
            | QueueEvent::Exhausted { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueEvent::RetryScheduled { .. })
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Scheduled or waiting for a free worker
    pub waiting: usize,
    /// Leased to a worker
    pub active: usize,
    /// Exhausted jobs kept for inspection
    pub dead: usize,
}

/// Durations travel as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
