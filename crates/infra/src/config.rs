//! Configuration loading and representation.
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binaries before calling [`AppConfig::from_env`]). Unset variables fall
//! back to defaults; set-but-invalid values are errors.

use std::time::Duration;

use crate::jobs::{JobOptions, QueueConfig, RetryPolicy};
use crate::workers::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Process configuration for the API server and worker binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Socket address the HTTP server binds to.
    pub http_addr: String,
    pub cors_origin: String,
    /// Use Postgres + Redis instead of in-memory stores.
    pub use_persistent: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    /// Run a worker pool inside the API process.
    pub embedded_worker: bool,
    pub worker: WorkerPoolConfig,
    pub queue: QueueConfig,
    /// Options applied to every job enqueued by the task service.
    pub job_defaults: JobOptions,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let port: u16 = env.parse("PORT", 3000)?;
        let use_persistent = env.parse("USE_PERSISTENT_STORES", false)?;
        let database_url = env.get("DATABASE_URL");
        if use_persistent && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let redis_url = match env.get("REDIS_URL") {
            Some(url) => url,
            None => {
                let host = env.get("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
                let port: u16 = env.parse("REDIS_PORT", 6379)?;
                let db: u32 = env.parse("REDIS_DB", 0)?;
                format!("redis://{host}:{port}/{db}")
            }
        };

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", 2)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let max_attempts: u32 = env.parse("TASK_MAX_ATTEMPTS", 3)?;
        let base_delay = env.millis("TASK_BACKOFF_BASE_MS", 2_000)?;
        let job_defaults = JobOptions {
            initial_delay: env.millis("TASK_INITIAL_DELAY_MS", 1_000)?,
            retry: RetryPolicy::exponential(max_attempts, base_delay, Duration::from_secs(300)),
        };

        let mut queue = QueueConfig::default();
        queue.visibility_timeout = env.millis(
            "QUEUE_VISIBILITY_TIMEOUT_MS",
            queue.visibility_timeout.as_millis() as u64,
        )?;
        if let Some(prefix) = env.get("QUEUE_KEY_PREFIX") {
            queue.key_prefix = prefix;
        }
        queue.max_stalled = env.parse("QUEUE_MAX_STALLED", queue.max_stalled)?;

        let worker = WorkerPoolConfig::default()
            .with_concurrency(concurrency)
            .with_step_pause(env.millis("WORKER_STEP_PAUSE_MS", 2_000)?)
            .with_lease_renewal(queue.visibility_timeout / 2);

        Ok(Self {
            http_addr: format!("0.0.0.0:{port}"),
            cors_origin: env
                .get("CORS_ORIGIN")
                .unwrap_or_else(|| "http://localhost:4200".to_string()),
            use_persistent,
            database_url,
            redis_url,
            embedded_worker: env.parse("EMBEDDED_WORKER", true)?,
            worker,
            queue,
            job_defaults,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}
