//! End-to-end tests for the task pipeline.
//!
//! Tests: TaskService → TaskStore + JobQueue → WorkerPool → StatusProjector
//!
//! Verifies:
//! - A successful task ends completed at 100% with a result
//! - An always-failing task is retried with backoff, then exhausted
//! - Unknown ids are reported as not found
//! - Concurrent workers never tear a task record

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    use taskflow_core::{NewTask, Progress, StatusUpdate, Task, TaskId, TaskStatus};

    use crate::jobs::{InMemoryJobQueue, JobOptions, JobQueue, QueueConfig, QueueEvent, RetryPolicy, TaskPayload};
    use crate::service::{ServiceError, TaskService};
    use crate::task_store::{InMemoryTaskStore, TaskStore, TaskStoreError};
    use crate::workers::{SimulatedWork, StatusProjector, WorkError, WorkFn, WorkerPool, WorkerPoolConfig};

    /// Wraps the in-memory store and keeps every accepted write.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryTaskStore,
        writes: Mutex<Vec<(Instant, Task)>>,
    }

    impl RecordingStore {
        fn writes_for(&self, id: TaskId) -> Vec<(Instant, Task)> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t)| t.id == id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl TaskStore for RecordingStore {
        async fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
            self.inner.create(input).await
        }

        async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
            self.inner.list().await
        }

        async fn update_status(&self, id: TaskId, update: &StatusUpdate) -> Result<Task, TaskStoreError> {
            let task = self.inner.update_status(id, update).await?;
            self.writes.lock().unwrap().push((Instant::now(), task.clone()));
            Ok(task)
        }

        async fn increment_retries(&self, id: TaskId) -> Result<u32, TaskStoreError> {
            self.inner.increment_retries(id).await
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl WorkFn for AlwaysFails {
        fn step_count(&self, _: &TaskPayload) -> u32 {
            3
        }

        async fn run_step(&self, _: &TaskPayload, step: u32) -> Result<i64, WorkError> {
            if step == 2 {
                return Err(WorkError::new("upstream timed out"));
            }
            Ok(30)
        }

        async fn finish(&self, _: &TaskPayload) -> Result<JsonValue, WorkError> {
            Ok(json!({}))
        }
    }

    /// Reports progress outside 0..=100.
    struct Overshoots;

    #[async_trait]
    impl WorkFn for Overshoots {
        fn step_count(&self, _: &TaskPayload) -> u32 {
            2
        }

        async fn run_step(&self, _: &TaskPayload, step: u32) -> Result<i64, WorkError> {
            Ok(if step == 1 { -20 } else { 150 })
        }

        async fn finish(&self, _: &TaskPayload) -> Result<JsonValue, WorkError> {
            Ok(json!({ "ok": true }))
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        queue: Arc<InMemoryJobQueue>,
        service: TaskService,
    }

    fn harness(queue_config: QueueConfig) -> Harness {
        let store = Arc::new(RecordingStore::default());
        let queue = Arc::new(InMemoryJobQueue::with_config(queue_config));
        let options = JobOptions::immediate().with_retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_secs(2),
            Duration::from_secs(300),
        ));
        let service = TaskService::new(store.clone(), queue.clone(), options);
        Harness { store, queue, service }
    }

    impl Harness {
        fn pool(&self, work: Arc<dyn WorkFn>, concurrency: usize) -> WorkerPool {
            WorkerPool::new(
                self.store.clone(),
                self.queue.clone(),
                work,
                WorkerPoolConfig::default()
                    .with_concurrency(concurrency)
                    .with_step_pause(Duration::from_millis(200)),
            )
        }
    }

    async fn next_terminal(events: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.is_terminal() {
                return event;
            }
        }
    }

    fn assert_record_invariants(task: &Task) {
        assert!(task.progress.value() <= 100);
        assert!(!(task.result.is_some() && task.error.is_some()));
        match task.status {
            TaskStatus::Completed => assert!(task.result.is_some()),
            TaskStatus::Failed => assert!(task.error.is_some()),
            _ => assert!(task.result.is_none() && task.error.is_none()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_task_completes_with_result() {
        let h = harness(QueueConfig::default());
        let pool = h.pool(Arc::new(SimulatedWork::new()), 2);
        let mut events = pool.subscribe();

        let task = h.service.submit("Nightly report", "aggregate yesterday's orders").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, Progress::ZERO);

        let handle = pool.spawn();
        let event = next_terminal(&mut events).await;
        assert!(matches!(event, QueueEvent::Completed { attempt: 1, .. }));
        handle.shutdown().await;

        let done = h.service.get(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, Progress::COMPLETE);
        assert!(done.result.is_some());
        assert!(done.error.is_none());
        assert_eq!(done.retries, 0);

        let writes = h.store.writes_for(task.id);
        let progress: Vec<u8> = writes.iter().map(|(_, t)| t.progress.value()).collect();
        assert_eq!(progress, vec![10, 36, 52, 68, 84, 90, 100]);
        for (_, t) in &writes {
            assert_record_invariants(t);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_is_retried_with_backoff_then_exhausted() {
        let h = harness(QueueConfig::default());
        let pool = h.pool(Arc::new(AlwaysFails), 2);
        let mut events = pool.subscribe();
        let handle = pool.spawn();

        let task = h.service.submit("Flaky import", "pull from a broken API").await.unwrap();

        let mut retries = Vec::new();
        let exhausted = loop {
            match events.recv().await.unwrap() {
                QueueEvent::RetryScheduled { next_attempt, delay, .. } => retries.push((next_attempt, delay)),
                other => break other,
            }
        };
        handle.shutdown().await;

        assert_eq!(
            retries,
            vec![(2, Duration::from_secs(2)), (3, Duration::from_secs(4))]
        );
        assert!(matches!(exhausted, QueueEvent::Exhausted { attempts: 3, .. }));

        let failed = h.service.get(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retries, 3);
        assert_eq!(failed.error.as_deref(), Some("upstream timed out"));

        let writes = h.store.writes_for(task.id);
        for (_, t) in &writes {
            assert_record_invariants(t);
        }

        // Exactly three processing episodes, each opened after the previous failure.
        let starts: Vec<(Instant, u32)> = writes
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Processing && t.progress == Progress::STARTED)
            .map(|(at, t)| (*at, t.attempt))
            .collect();
        let failures: Vec<(Instant, u32)> = writes
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Failed)
            .map(|(at, t)| (*at, t.retries))
            .collect();
        assert_eq!(starts.iter().map(|(_, a)| *a).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(failures.iter().map(|(_, r)| *r).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert!(starts[1].0 - failures[0].0 >= Duration::from_secs(2));
        assert!(starts[2].0 - failures[1].0 >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = harness(QueueConfig::default());
        let id = TaskId::new();
        assert!(matches!(h.service.get(id).await, Err(ServiceError::NotFound(found)) if found == id));
    }

    #[tokio::test(start_paused = true)]
    async fn overshooting_progress_is_clamped() {
        let h = harness(QueueConfig::default());
        let pool = h.pool(Arc::new(Overshoots), 1);
        let mut events = pool.subscribe();
        let handle = pool.spawn();

        let task = h.service.submit("Clamp", "report silly progress").await.unwrap();
        next_terminal(&mut events).await;
        handle.shutdown().await;

        let progress: Vec<u8> = h
            .store
            .writes_for(task.id)
            .iter()
            .map(|(_, t)| t.progress.value())
            .collect();
        assert_eq!(progress, vec![10, 0, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_process_every_task_once() {
        let h = harness(QueueConfig::default());
        let pool = h.pool(Arc::new(SimulatedWork::new()), 4);
        let mut events = pool.subscribe();
        let handle = pool.spawn();

        let mut ids = Vec::new();
        for i in 0..10 {
            let task = h.service.submit(&format!("task {i}"), "batch member").await.unwrap();
            ids.push(task.id);
        }

        let mut completed = Vec::new();
        while completed.len() < ids.len() {
            if let QueueEvent::Completed { task_id, .. } = next_terminal(&mut events).await {
                completed.push(task_id);
            }
        }
        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_succeeded, 10);

        completed.sort();
        ids.sort();
        assert_eq!(completed, ids);

        for task in h.service.list().await.unwrap() {
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.attempt, 1);
            assert_eq!(task.retries, 0);
            assert_record_invariants(&task);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crash_after_failed_write_is_redelivered_once_counted() {
        let h = harness(QueueConfig {
            visibility_timeout: Duration::from_secs(5),
            ..QueueConfig::default()
        });
        let task = h.service.submit("Crashy", "worker dies mid-attempt").await.unwrap();

        // First worker records the failure, then dies before nacking.
        let crashed = h.queue.dequeue().await.unwrap();
        let projector = StatusProjector::new(h.store.clone());
        projector.start_attempt(task.id, crashed.attempt()).await.unwrap();
        projector.fail(task.id, crashed.attempt(), "killed").await.unwrap();

        let pool = h.pool(Arc::new(SimulatedWork::new()), 1);
        let mut events = pool.subscribe();
        let handle = pool.spawn();

        let event = next_terminal(&mut events).await;
        assert!(matches!(event, QueueEvent::Completed { attempt: 2, .. }));
        handle.shutdown().await;

        let done = h.service.get(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retries, 1);
        assert!(done.error.is_none());

        // The dead worker's late write is fenced off.
        let late = projector.progress(task.id, crashed.attempt(), 50).await.unwrap_err();
        assert!(matches!(late, TaskStoreError::StaleAttempt { attempt: 1, current: 2, .. }));
        assert!(h.queue.ack(&crashed).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn crash_on_last_attempt_never_opens_another_episode() {
        let h = harness(QueueConfig {
            visibility_timeout: Duration::from_secs(5),
            ..QueueConfig::default()
        });
        let task = h.service.submit("Doomed", "fails every time").await.unwrap();
        let pool = h.pool(Arc::new(AlwaysFails), 1);

        for _ in 0..2 {
            let delivery = h.queue.dequeue().await.unwrap();
            let event = pool.process(&delivery).await.unwrap();
            assert!(matches!(event, Some(QueueEvent::RetryScheduled { .. })));
        }

        // The third and last allowed attempt records its failure, then the worker dies.
        let crashed = h.queue.dequeue().await.unwrap();
        assert_eq!(crashed.attempt(), 3);
        let projector = StatusProjector::new(h.store.clone());
        projector.start_attempt(task.id, 3).await.unwrap();
        assert_eq!(projector.fail(task.id, 3, "killed").await.unwrap().retries, 3);

        let mut events = pool.subscribe();
        let handle = pool.spawn();
        let event = next_terminal(&mut events).await;
        assert!(matches!(event, QueueEvent::Exhausted { attempts: 4, .. }));
        handle.shutdown().await;

        let failed = h.service.get(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retries, 3);
        assert_eq!(failed.attempt, 3);

        let episodes = h
            .store
            .writes_for(task.id)
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Processing && t.progress == Progress::STARTED)
            .count();
        assert_eq!(episodes, 3);
        assert_eq!(h.queue.dead_letters().unwrap().len(), 1);
    }
}
