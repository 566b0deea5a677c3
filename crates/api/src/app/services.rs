//! Store and queue wiring for the HTTP server and the worker binary.
//!
//! Two modes, picked by `USE_PERSISTENT_STORES`:
//! - in-memory (default): single process, the embedded worker pool is the only consumer
//! - persistent: Postgres task store + Redis job queue, shared with standalone workers

use std::sync::Arc;

use anyhow::Context;

use taskflow_infra::AppConfig;
use taskflow_infra::TaskService;
use taskflow_infra::jobs::{InMemoryJobQueue, JobQueue, RedisJobQueue};
use taskflow_infra::task_store::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use taskflow_infra::workers::{SimulatedWork, WorkerPool, WorkerPoolConfig};

/// Explicit handles shared by routes and workers.
#[derive(Clone)]
pub struct AppServices {
    pub tasks: TaskService,
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn JobQueue>,
    /// `true` when state lives outside this process.
    pub persistent: bool,
}

impl AppServices {
    pub fn in_memory(config: &AppConfig) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::with_config(config.queue.clone()));
        Self::assemble(store, queue, config, false)
    }

    /// Connect to Postgres and Redis. Either being unreachable is an error.
    pub async fn persistent(config: &AppConfig) -> anyhow::Result<Self> {
        let database_url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

        let store = PostgresTaskStore::connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        tracing::info!("connected to Postgres task store");

        let queue = RedisJobQueue::connect(&config.redis_url, config.queue.clone())
            .await
            .context("failed to connect to Redis")?;

        Ok(Self::assemble(Arc::new(store), Arc::new(queue), config, true))
    }

    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if config.use_persistent {
            Self::persistent(config).await
        } else {
            tracing::info!("using in-memory task store and job queue");
            Ok(Self::in_memory(config))
        }
    }

    /// A worker pool running [`SimulatedWork`] against these handles.
    pub fn worker_pool(&self, config: WorkerPoolConfig) -> WorkerPool {
        let work = SimulatedWork::new().with_estimated_duration(config.step_pause * 5);
        WorkerPool::new(self.store.clone(), self.queue.clone(), Arc::new(work), config)
    }

    fn assemble(store: Arc<dyn TaskStore>, queue: Arc<dyn JobQueue>, config: &AppConfig, persistent: bool) -> Self {
        Self {
            tasks: TaskService::new(store.clone(), queue.clone(), config.job_defaults.clone()),
            store,
            queue,
            persistent,
        }
    }
}
