//! In-memory job queue for tests/dev.
//!
//! Not durable: state lives in the process. Timers use `tokio::time`, so tests
//! can drive delays and visibility timeouts with a paused clock.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{Delivery, JobQueue, QueueConfig, QueueError, failure_event};
use super::types::{AttemptFailure, Job, JobId, JobOptions, QueueEvent, QueueStats, TaskPayload};

#[derive(Debug)]
struct Lease {
    receipt: Uuid,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// `(eligible_at, sequence, job)`; the sequence keeps equal instants FIFO.
    scheduled: BTreeSet<(Instant, u64, JobId)>,
    leases: HashMap<JobId, Lease>,
    dead: VecDeque<Job>,
    sequence: u64,
}

impl State {
    fn schedule(&mut self, job_id: JobId, at: Instant) {
        self.sequence += 1;
        self.scheduled.insert((at, self.sequence, job_id));
    }

    /// Return expired leases to the schedule as new attempts, or bury jobs
    /// that stalled more than `max_stalled` times.
    fn reclaim_expired(&mut self, now: Instant, config: &QueueConfig) -> usize {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for job_id in &expired {
            self.leases.remove(job_id);
            let Some(job) = self.jobs.get_mut(job_id) else {
                continue;
            };
            job.stalled += 1;

            if job.stalled > config.max_stalled {
                let mut dead = job.clone();
                dead.last_error = Some(format!("job stalled more than {} times", config.max_stalled));
                error!(job_id = %job_id, task_id = %dead.task_id(), stalled = dead.stalled, "job stalled too often; moving to dead letters");
                self.jobs.remove(job_id);
                self.bury(dead, config.dead_letter_limit);
                continue;
            }

            job.attempt += 1;
            job.last_error = Some("visibility timeout expired".to_string());
            warn!(job_id = %job_id, task_id = %job.task_id(), attempt = job.attempt, stalled = job.stalled, "lease expired; redelivering job");
            self.schedule(*job_id, now);
        }

        expired.len()
    }

    fn bury(&mut self, job: Job, limit: usize) {
        self.dead.push_back(job);
        while self.dead.len() > limit {
            self.dead.pop_front();
        }
    }

    fn claim_ready(&mut self, now: Instant, visibility: std::time::Duration) -> Option<Delivery> {
        while let Some(&entry) = self.scheduled.iter().next() {
            let (eligible_at, _, job_id) = entry;
            if eligible_at > now {
                return None;
            }
            self.scheduled.remove(&entry);

            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };

            let receipt = Uuid::now_v7();
            self.leases.insert(
                job_id,
                Lease {
                    receipt,
                    deadline: now + visibility,
                },
            );
            return Some(Delivery {
                job: job.clone(),
                receipt,
            });
        }
        None
    }

    fn next_wake(&self) -> Option<Instant> {
        let next_scheduled = self.scheduled.iter().next().map(|(at, _, _)| *at);
        let next_expiry = self.leases.values().map(|l| l.deadline).min();
        match (next_scheduled, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn release(&mut self, delivery: &Delivery) -> Result<Job, QueueError> {
        let job_id = delivery.job_id();
        match self.leases.get(&job_id) {
            Some(lease) if lease.receipt == delivery.receipt => {}
            _ => return Err(QueueError::LeaseLost(job_id)),
        }
        self.leases.remove(&job_id);
        self.jobs
            .get(&job_id)
            .cloned()
            .ok_or(QueueError::LeaseLost(job_id))
    }
}

/// In-memory queue with real delay, lease and retry semantics.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Exhausted jobs, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.lock()?.dead.iter().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue state poisoned".to_string()))
    }

    /// Lock and reclaim expired leases, waking waiters if anything moved.
    fn lock_reclaimed(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        let mut state = self.lock()?;
        if state.reclaim_expired(Instant::now(), &self.config) > 0 {
            self.notify.notify_waiters();
        }
        Ok(state)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: TaskPayload, options: JobOptions) -> Result<Job, QueueError> {
        let job = Job::new(payload, options);
        {
            let mut state = self.lock()?;
            let eligible_at = Instant::now() + job.options.initial_delay;
            state.jobs.insert(job.id, job.clone());
            state.schedule(job.id, eligible_at);
        }
        self.notify.notify_waiters();

        info!(job_id = %job.id, task_id = %job.task_id(), delay_ms = job.options.initial_delay.as_millis() as u64, "job enqueued");
        Ok(job)
    }

    async fn dequeue(&self) -> Result<Delivery, QueueError> {
        loop {
            // Register interest before inspecting state so an enqueue between
            // the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock_reclaimed()?;
                if let Some(delivery) = state.claim_ready(Instant::now(), self.config.visibility_timeout) {
                    debug!(job_id = %delivery.job_id(), attempt = delivery.attempt(), "job delivered");
                    return Ok(delivery);
                }
                state.next_wake()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock_reclaimed()?;
        match state.leases.get_mut(&delivery.job_id()) {
            Some(lease) if lease.receipt == delivery.receipt => {
                lease.deadline = Instant::now() + self.config.visibility_timeout;
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(delivery.job_id())),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<QueueEvent, QueueError> {
        let mut state = self.lock_reclaimed()?;
        let job = state.release(delivery)?;
        state.jobs.remove(&job.id);

        Ok(QueueEvent::Completed {
            job_id: job.id,
            task_id: job.task_id(),
            attempt: job.attempt,
        })
    }

    async fn nack(&self, delivery: &Delivery, failure: &AttemptFailure) -> Result<QueueEvent, QueueError> {
        let event = {
            let mut state = self.lock_reclaimed()?;
            let job = state.release(delivery)?;
            let event = failure_event(&job, failure);

            match &event {
                QueueEvent::RetryScheduled { delay, .. } => {
                    if let Some(stored) = state.jobs.get_mut(&job.id) {
                        stored.attempt += 1;
                        stored.last_error = Some(failure.error.clone());
                    }
                    state.schedule(job.id, Instant::now() + *delay);
                }
                _ => {
                    state.jobs.remove(&job.id);
                    let mut dead = job;
                    dead.last_error = Some(failure.error.clone());
                    state.bury(dead, self.config.dead_letter_limit);
                }
            }
            event
        };

        // Waiters may be parked without a deadline; let them recompute.
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock_reclaimed()?;
        Ok(QueueStats {
            waiting: state.scheduled.len(),
            active: state.leases.len(),
            dead: state.dead.len(),
        })
    }
}
