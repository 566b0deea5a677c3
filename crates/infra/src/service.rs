//! Task service: the write path behind the HTTP layer.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument};

use taskflow_core::{DomainError, NewTask, Task, TaskId};

use crate::jobs::{JobOptions, JobQueue, QueueError, TaskPayload};
use crate::task_store::{TaskStore, TaskStoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task store error: {0}")]
    Store(TaskStoreError),

    /// The task was created but could not be enqueued; it stays `pending`.
    #[error("task {task_id} created but not enqueued: {source}")]
    Queue {
        task_id: TaskId,
        #[source]
        source: QueueError,
    },
}

impl From<TaskStoreError> for ServiceError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// Creates tasks and hands them to the queue.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    options: JobOptions,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn JobQueue>, options: JobOptions) -> Self {
        Self { store, queue, options }
    }

    /// Validate, persist, then enqueue a new task.
    #[instrument(skip(self, name, description), err)]
    pub async fn submit(&self, name: &str, description: &str) -> Result<Task, ServiceError> {
        let input = NewTask::new(name, description)?;
        let task = self.store.create(input).await?;

        let payload = TaskPayload {
            task_id: task.id,
            name: task.name.clone(),
            description: task.description.clone(),
        };

        match self.queue.enqueue(payload, self.options.clone()).await {
            Ok(job) => {
                info!(task_id = %task.id, job_id = %job.id, "task submitted");
                Ok(task)
            }
            Err(source) => {
                error!(task_id = %task.id, error = %source, "task created but enqueue failed");
                Err(ServiceError::Queue {
                    task_id: task.id,
                    source,
                })
            }
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, ServiceError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Task>, ServiceError> {
        Ok(self.store.list().await?)
    }
}
