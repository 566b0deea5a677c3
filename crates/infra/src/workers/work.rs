//! Injectable work strategy run by the worker pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use crate::jobs::TaskPayload;

/// Failure raised by a work step; the message is recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct WorkError(pub String);

impl WorkError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The unit of work executed for each delivered job.
///
/// The pool calls `run_step` for `1..=step_count`, pausing between steps, and
/// `finish` once every step succeeded. Any error fails the attempt.
#[async_trait]
pub trait WorkFn: Send + Sync {
    fn step_count(&self, payload: &TaskPayload) -> u32;

    /// Run one step, returning the raw progress to report (clamped by the caller).
    async fn run_step(&self, payload: &TaskPayload, step: u32) -> Result<i64, WorkError>;

    /// Produce the task result.
    async fn finish(&self, payload: &TaskPayload) -> Result<JsonValue, WorkError>;
}

/// Stand-in workload: five steps, then a summary result.
///
/// Result figures are derived from the task id, so reruns of the same task
/// report the same numbers.
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    steps: u32,
    estimated_duration: Duration,
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self {
            steps: 5,
            estimated_duration: Duration::from_secs(10),
        }
    }
}

impl SimulatedWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the duration advertised in the result (normally `steps * step_pause`).
    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn progress_for_step(step: u32) -> i64 {
        (20 + 16 * i64::from(step)).min(90)
    }
}

#[async_trait]
impl WorkFn for SimulatedWork {
    fn step_count(&self, _payload: &TaskPayload) -> u32 {
        self.steps
    }

    async fn run_step(&self, _payload: &TaskPayload, step: u32) -> Result<i64, WorkError> {
        Ok(Self::progress_for_step(step))
    }

    async fn finish(&self, payload: &TaskPayload) -> Result<JsonValue, WorkError> {
        let seed = payload.task_id.as_uuid().as_u128();
        let items = 100 + (seed % 1_000) as u64;
        let success_rate = 0.80 + ((seed >> 64) % 21) as f64 / 100.0;

        Ok(json!({
            "processedAt": Utc::now().to_rfc3339(),
            "itemsProcessed": items,
            "successRate": format!("{success_rate:.2}"),
            "executionTime": format!("~{} seconds", self.estimated_duration.as_secs()),
        }))
    }
}
