//! Delay-aware job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs carry a [`TaskPayload`] snapshot; the queue never touches task records
//! - Delivery is at-least-once: leases expire after the visibility timeout
//! - The [`RetryPolicy`] is consulted with the failure count the worker reports
//! - Exhausted jobs land in a capped dead-letter list
//!
//! ## Components
//!
//! - `JobQueue`: enqueue / dequeue / touch / ack / nack
//! - `InMemoryJobQueue`: single-process backend for dev and tests
//! - `RedisJobQueue`: durable backend (feature `redis`)

pub mod in_memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;

pub use in_memory::InMemoryJobQueue;
pub use queue::{Delivery, JobQueue, QueueConfig, QueueError};
#[cfg(feature = "redis")]
pub use redis::RedisJobQueue;
pub use types::{
    AttemptFailure, BackoffStrategy, Job, JobId, JobOptions, QueueEvent, QueueStats, RetryDecision,
    RetryPolicy, TaskPayload,
};
