//! Task Store: the authoritative record of every task.
//!
//! Every status write goes through [`TaskStore::update_status`], which
//! validates the update against the current record (status graph + attempt
//! fencing, see [`Task::apply`]) and overwrites it inside one critical
//! section. Two writers on the same id are serialized; the loser either sees
//! the winner's record or is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use taskflow_core::{NewTask, StatusUpdate, Task, TaskId, TaskStatus, TransitionError};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

/// Task store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("stale write to task {task_id}: attempt {attempt} < current attempt {current}")]
    StaleAttempt {
        task_id: TaskId,
        attempt: u32,
        current: u32,
    },

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskStoreError {
    pub fn from_transition(task_id: TaskId, err: TransitionError) -> Self {
        match err {
            TransitionError::StaleAttempt { attempt, current } => Self::StaleAttempt {
                task_id,
                attempt,
                current,
            },
            TransitionError::Illegal { from, to, .. } => Self::InvalidTransition { task_id, from, to },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task in `pending` with progress 0.
    async fn create(&self, input: NewTask) -> Result<Task, TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError>;

    /// All tasks, newest first; equal timestamps keep insertion order.
    async fn list(&self) -> Result<Vec<Task>, TaskStoreError>;

    /// Validate and apply a status update atomically, returning the new record.
    async fn update_status(&self, id: TaskId, update: &StatusUpdate) -> Result<Task, TaskStoreError>;

    /// Bump the failure counter outside a status transition.
    ///
    /// The worker never needs this (a `failed` update already counts), it is
    /// kept for operator tooling.
    async fn increment_retries(&self, id: TaskId) -> Result<u32, TaskStoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        (**self).create(input).await
    }

    async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError> {
        (**self).get(id).await
    }

    async fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list().await
    }

    async fn update_status(&self, id: TaskId, update: &StatusUpdate) -> Result<Task, TaskStoreError> {
        (**self).update_status(id, update).await
    }

    async fn increment_retries(&self, id: TaskId) -> Result<u32, TaskStoreError> {
        (**self).increment_retries(id).await
    }
}
