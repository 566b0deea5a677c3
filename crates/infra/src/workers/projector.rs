//! Status Projector: the only writer of task status from the worker side.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use taskflow_core::{Progress, StatusUpdate, Task, TaskId};

use crate::task_store::{TaskStore, TaskStoreError};

/// Turns worker milestones into attempt-tagged [`StatusUpdate`]s.
#[derive(Clone)]
pub struct StatusProjector {
    store: Arc<dyn TaskStore>,
}

impl StatusProjector {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Current record, read before opening a redelivered attempt.
    pub async fn current(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        self.store.get(task_id).await
    }

    /// Open `attempt`: `processing` at 10%.
    pub async fn start_attempt(&self, task_id: TaskId, attempt: u32) -> Result<Task, TaskStoreError> {
        debug!(%task_id, attempt, "starting attempt");
        self.store
            .update_status(task_id, &StatusUpdate::processing(attempt, Progress::STARTED))
            .await
    }

    pub async fn progress(&self, task_id: TaskId, attempt: u32, raw: i64) -> Result<Task, TaskStoreError> {
        let progress = Progress::clamped(raw);
        debug!(%task_id, attempt, %progress, "progress");
        self.store
            .update_status(task_id, &StatusUpdate::processing(attempt, progress))
            .await
    }

    pub async fn complete(&self, task_id: TaskId, attempt: u32, result: JsonValue) -> Result<Task, TaskStoreError> {
        self.store
            .update_status(task_id, &StatusUpdate::completed(attempt, result))
            .await
    }

    /// Record the failure; the returned task's `retries` is the authoritative
    /// failure count for the retry decision.
    pub async fn fail(&self, task_id: TaskId, attempt: u32, error: &str) -> Result<Task, TaskStoreError> {
        self.store
            .update_status(task_id, &StatusUpdate::failed(attempt, error))
            .await
    }
}
