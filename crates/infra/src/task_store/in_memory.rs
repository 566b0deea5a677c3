use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use taskflow_core::{NewTask, StatusUpdate, Task, TaskId};

use super::{TaskStore, TaskStoreError};

#[derive(Debug)]
struct Entry {
    seq: u64,
    task: Task,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    next_seq: u64,
}

/// In-memory task store.
///
/// Intended for tests/dev. A single `RwLock` serializes writers, so the
/// validate-and-overwrite in `update_status` is atomic per id.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned<T>(_: T) -> TaskStoreError {
        TaskStoreError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        let task = Task::new(input, Utc::now());

        let mut inner = self.inner.write().map_err(Self::poisoned)?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.insert(task.id, Entry { seq, task: task.clone() });

        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError> {
        let inner = self.inner.read().map_err(Self::poisoned)?;
        inner
            .tasks
            .get(&id)
            .map(|e| e.task.clone())
            .ok_or(TaskStoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        let inner = self.inner.read().map_err(Self::poisoned)?;
        let mut entries: Vec<&Entry> = inner.tasks.values().collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        Ok(entries.into_iter().map(|e| e.task.clone()).collect())
    }

    async fn update_status(&self, id: TaskId, update: &StatusUpdate) -> Result<Task, TaskStoreError> {
        let mut inner = self.inner.write().map_err(Self::poisoned)?;
        let entry = inner.tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;

        // Apply to a copy so a rejected update leaves the record untouched.
        let mut next = entry.task.clone();
        next.apply(update, Utc::now())
            .map_err(|e| TaskStoreError::from_transition(id, e))?;
        entry.task = next.clone();

        Ok(next)
    }

    async fn increment_retries(&self, id: TaskId) -> Result<u32, TaskStoreError> {
        let mut inner = self.inner.write().map_err(Self::poisoned)?;
        let entry = inner.tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        entry.task.retries += 1;
        entry.task.touch(Utc::now());
        Ok(entry.task.retries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use taskflow_core::{Progress, TaskStatus};

    use super::*;

    fn new_task(name: &str) -> NewTask {
        NewTask::new(name, "some description").unwrap()
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let store = InMemoryTaskStore::new();
        let task = store.create(new_task("a")).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, Progress::ZERO);
        assert_eq!(task.retries, 0);
        assert_eq!(task.attempt, 0);
        assert_eq!(store.get(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::new();
        assert_eq!(store.get(id).await.unwrap_err(), TaskStoreError::NotFound(id));
        assert!(
            store
                .update_status(id, &StatusUpdate::processing(1, Progress::STARTED))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn get_is_idempotent() {
        let store = InMemoryTaskStore::new();
        let task = store.create(new_task("a")).await.unwrap();
        assert_eq!(store.get(task.id).await.unwrap(), store.get(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_stable() {
        let store = InMemoryTaskStore::new();
        let a = store.create(new_task("a")).await.unwrap();
        let b = store.create(new_task("b")).await.unwrap();
        let c = store.create(new_task("c")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 3);
        for pair in listed.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }

        // Ties keep insertion order.
        let pos = |id| listed.iter().position(|t| t.id == id).unwrap();
        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            if x.created_at == y.created_at {
                assert!(pos(x.id) < pos(y.id));
            } else {
                assert!(pos(y.id) < pos(x.id));
            }
        }
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let store = InMemoryTaskStore::new();
        let a = store.create(new_task("a")).await.unwrap();
        let b = store.create(new_task("b")).await.unwrap();
        let c = store.create(new_task("c")).await.unwrap();
        let newest = store.create(new_task("newest")).await.unwrap();

        // Force a, b and c onto one instant, older than `newest`.
        let shared = newest.created_at - chrono::Duration::seconds(1);
        {
            let mut inner = store.inner.write().unwrap();
            for id in [a.id, b.id, c.id] {
                inner.tasks.get_mut(&id).unwrap().task.created_at = shared;
            }
        }

        let order: Vec<TaskId> = store.list().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec![newest.id, a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn failed_update_counts_retry_in_same_write() {
        let store = InMemoryTaskStore::new();
        let task = store.create(new_task("a")).await.unwrap();

        store
            .update_status(task.id, &StatusUpdate::processing(1, Progress::STARTED))
            .await
            .unwrap();
        let failed = store
            .update_status(task.id, &StatusUpdate::failed(1, "boom"))
            .await
            .unwrap();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.result.is_none());
    }

    #[tokio::test]
    async fn rejected_update_leaves_record_untouched() {
        let store = InMemoryTaskStore::new();
        let task = store.create(new_task("a")).await.unwrap();
        store
            .update_status(task.id, &StatusUpdate::processing(2, Progress::STARTED))
            .await
            .unwrap();
        let before = store.get(task.id).await.unwrap();

        let err = store
            .update_status(task.id, &StatusUpdate::completed(1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::StaleAttempt { attempt: 1, current: 2, .. }));

        let err = store
            .update_status(task.id, &StatusUpdate::completed(3, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::InvalidTransition {
                from: TaskStatus::Processing,
                to: TaskStatus::Completed,
                ..
            }
        ));

        assert_eq!(store.get(task.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn increment_retries_returns_new_count() {
        let store = InMemoryTaskStore::new();
        let task = store.create(new_task("a")).await.unwrap();
        assert_eq!(store.increment_retries(task.id).await.unwrap(), 1);
        assert_eq!(store.increment_retries(task.id).await.unwrap(), 2);
        assert!(store.increment_retries(TaskId::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_never_tear_the_record() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.create(new_task("a")).await.unwrap();

        let mut handles = Vec::new();
        for attempt in 1..=8u32 {
            let store = store.clone();
            let id = task.id;
            handles.push(tokio::spawn(async move {
                let _ = store
                    .update_status(id, &StatusUpdate::processing(attempt, Progress::STARTED))
                    .await;
                for p in [30, 60, 90] {
                    let _ = store
                        .update_status(id, &StatusUpdate::processing(attempt, Progress::clamped(p)))
                        .await;
                }
                if attempt % 2 == 0 {
                    let _ = store
                        .update_status(id, &StatusUpdate::completed(attempt, json!({ "attempt": attempt })))
                        .await;
                } else {
                    let _ = store.update_status(id, &StatusUpdate::failed(attempt, "boom")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let done = store.get(task.id).await.unwrap();
        assert!(done.progress.value() <= 100);
        assert!(!(done.result.is_some() && done.error.is_some()));
        match done.status {
            TaskStatus::Completed => {
                assert_eq!(done.progress, Progress::COMPLETE);
                assert_eq!(done.result, Some(json!({ "attempt": done.attempt })));
            }
            TaskStatus::Failed => {
                assert_eq!(done.attempt % 2, 1);
                assert!(done.error.is_some());
            }
            TaskStatus::Processing => assert!(done.result.is_none() && done.error.is_none()),
            TaskStatus::Pending => panic!("task never started"),
        }
    }
}
