//! Redis-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - `{prefix}:jobs`: hash `job_id -> job JSON`
//! - `{prefix}:delayed`: sorted set of job ids scored by eligible-at (ms)
//! - `{prefix}:active`: sorted set of leased job ids scored by lease deadline (ms)
//! - `{prefix}:leases`: hash `job_id -> receipt`
//! - `{prefix}:dead`: list of exhausted job JSON (capped)
//!
//! Every state change that touches more than one key is a Lua script, so a
//! claim, ack or retry is atomic from the point of view of other workers.
//! Expired leases are swept back into `delayed` by the claim script itself,
//! or into `dead` once a job has stalled more than `max_stalled` times.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::queue::{Delivery, JobQueue, QueueConfig, QueueError, failure_event};
use super::types::{AttemptFailure, Job, JobOptions, QueueEvent, QueueStats, TaskPayload};

const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  local raw = redis.call('HGET', KEYS[4], id)
  if raw then
    local job = cjson.decode(raw)
    job['stalled'] = (job['stalled'] or 0) + 1
    if job['stalled'] > tonumber(ARGV[4]) then
      job['last_error'] = 'job stalled more than ' .. ARGV[4] .. ' times'
      redis.call('HDEL', KEYS[4], id)
      redis.call('LPUSH', KEYS[5], cjson.encode(job))
      redis.call('LTRIM', KEYS[5], 0, tonumber(ARGV[5]) - 1)
    else
      job['attempt'] = job['attempt'] + 1
      job['last_error'] = 'visibility timeout expired'
      redis.call('HSET', KEYS[4], id, cjson.encode(job))
      redis.call('ZADD', KEYS[1], ARGV[1], id)
    end
  end
end
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', KEYS[3], id, ARGV[3])
return redis.call('HGET', KEYS[4], id)
"#;

const TOUCH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
"#;

const BURY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('LPUSH', KEYS[4], ARGV[3])
redis.call('LTRIM', KEYS[4], 0, tonumber(ARGV[4]) - 1)
return 1
"#;

#[derive(Debug, Clone)]
struct Keys {
    jobs: String,
    delayed: String,
    active: String,
    leases: String,
    dead: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}:jobs"),
            delayed: format!("{prefix}:delayed"),
            active: format!("{prefix}:active"),
            leases: format!("{prefix}:leases"),
            dead: format!("{prefix}:dead"),
        }
    }
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    keys: Keys,
    config: QueueConfig,
    claim: Script,
    touch: Script,
    ack: Script,
    retry: Script,
    bury: Script,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn after(delay: Duration) -> i64 {
    now_ms() + delay.as_millis() as i64
}

impl RedisJobQueue {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379/0")
    pub async fn connect(redis_url: impl AsRef<str>, config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        info!(prefix = %config.key_prefix, "connected to redis job queue");

        Ok(Self {
            conn,
            keys: Keys::new(&config.key_prefix),
            config,
            claim: Script::new(CLAIM_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            bury: Script::new(BURY_SCRIPT),
        })
    }

    async fn claim_once(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let receipt = Uuid::now_v7();

        let mut invocation = self.claim.prepare_invoke();
        invocation
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.jobs)
            .key(&self.keys.dead)
            .arg(now)
            .arg(now + self.config.visibility_timeout.as_millis() as i64)
            .arg(receipt.to_string())
            .arg(self.config.max_stalled)
            .arg(self.config.dead_letter_limit);

        let raw: Option<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let job: Job = serde_json::from_str(&raw).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Some(Delivery { job, receipt }))
    }

    /// Run a lease-checked script; `0` means the receipt no longer owns the job.
    async fn leased(&self, delivery: &Delivery, invocation: &redis::ScriptInvocation<'_>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let owned: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if owned == 0 {
            warn!(job_id = %delivery.job_id(), "lease no longer held");
            return Err(QueueError::LeaseLost(delivery.job_id()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, payload, options), fields(task_id = %payload.task_id), err)]
    async fn enqueue(&self, payload: TaskPayload, options: JobOptions) -> Result<Job, QueueError> {
        let job = Job::new(payload, options);
        let body = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = job.id.to_string();

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, &id, body)
            .ignore()
            .zadd(&self.keys.delayed, &id, after(job.options.initial_delay))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        info!(job_id = %job.id, delay_ms = job.options.initial_delay.as_millis() as u64, "job enqueued");
        Ok(job)
    }

    async fn dequeue(&self) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.claim_once().await? {
                debug!(job_id = %delivery.job_id(), attempt = delivery.attempt(), "job delivered");
                return Ok(delivery);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut invocation = self.touch.prepare_invoke();
        invocation
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .arg(delivery.job_id().to_string())
            .arg(delivery.receipt.to_string())
            .arg(after(self.config.visibility_timeout));
        self.leased(delivery, &invocation).await
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id(), attempt = delivery.attempt()), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<QueueEvent, QueueError> {
        let mut invocation = self.ack.prepare_invoke();
        invocation
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.jobs)
            .arg(delivery.job_id().to_string())
            .arg(delivery.receipt.to_string());
        self.leased(delivery, &invocation).await?;

        Ok(QueueEvent::Completed {
            job_id: delivery.job.id,
            task_id: delivery.job.task_id(),
            attempt: delivery.job.attempt,
        })
    }

    #[instrument(skip(self, delivery, failure), fields(job_id = %delivery.job_id(), failures = failure.failures), err)]
    async fn nack(&self, delivery: &Delivery, failure: &AttemptFailure) -> Result<QueueEvent, QueueError> {
        let event = failure_event(&delivery.job, failure);

        let mut job = delivery.job.clone();
        job.last_error = Some(failure.error.clone());

        match &event {
            QueueEvent::RetryScheduled { delay, .. } => {
                job.attempt += 1;
                let body = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
                let mut invocation = self.retry.prepare_invoke();
                invocation
                    .key(&self.keys.active)
                    .key(&self.keys.leases)
                    .key(&self.keys.jobs)
                    .key(&self.keys.delayed)
                    .arg(job.id.to_string())
                    .arg(delivery.receipt.to_string())
                    .arg(body)
                    .arg(after(*delay));
                self.leased(delivery, &invocation).await?;
            }
            _ => {
                let body = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
                let mut invocation = self.bury.prepare_invoke();
                invocation
                    .key(&self.keys.active)
                    .key(&self.keys.leases)
                    .key(&self.keys.jobs)
                    .key(&self.keys.dead)
                    .arg(job.id.to_string())
                    .arg(delivery.receipt.to_string())
                    .arg(body)
                    .arg(self.config.dead_letter_limit.max(1));
                self.leased(delivery, &invocation).await?;
                warn!(job_id = %job.id, attempts = job.attempt, "job exhausted; moved to dead-letter list");
            }
        }

        Ok(event)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, dead): (usize, usize, usize) = redis::pipe()
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.active)
            .llen(&self.keys.dead)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(QueueStats { waiting, active, dead })
    }
}
