//! Task record and its lifecycle.
//!
//! A `Task` is the durable record of one unit of requested work. Its status
//! moves through a closed graph:
//!
//! ```text
//! pending ──► processing ──► completed
//!                │  ▲  ▲
//!                │  │  └── (progress updates)
//!                ▼  │
//!              failed   (only re-entered from a newer delivery attempt)
//! ```
//!
//! Every mutation goes through [`Task::apply`], which validates the edge and
//! fences writers by delivery attempt: a write tagged with an attempt older
//! than the one currently recorded is rejected, so a worker whose lease was
//! reclaimed can never overwrite progress of the attempt that replaced it.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the status graph.
    ///
    /// `failed -> processing` is an edge, but [`Task::apply`] only accepts it
    /// when the write comes from a newer delivery attempt.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Progress percentage, always within `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Progress(u8);

impl Progress {
    pub const ZERO: Progress = Progress(0);
    /// Progress written when a delivery attempt starts.
    pub const STARTED: Progress = Progress(10);
    pub const COMPLETE: Progress = Progress(100);

    /// Build a progress value, clamping anything outside `0..=100`.
    pub fn clamped(raw: i64) -> Self {
        Self(raw.clamp(0, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<i64> for Progress {
    fn from(raw: i64) -> Self {
        Self::clamped(raw)
    }
}

impl From<Progress> for u8 {
    fn from(p: Progress) -> Self {
        p.0
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Validated input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    name: String,
    description: String,
}

impl NewTask {
    /// Both fields are trimmed and must be non-empty afterwards.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> DomainResult<Self> {
        let name = name.into().trim().to_string();
        let description = description.into().trim().to_string();

        if name.is_empty() {
            return Err(DomainError::validation("name is required"));
        }
        if description.is_empty() {
            return Err(DomainError::validation("description is required"));
        }

        Ok(Self { name, description })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// A lifecycle event written into the record by a worker.
///
/// `result` and `error` only exist on the variant that owns them, so a single
/// write can never carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskTransition {
    Processing { progress: Progress },
    Completed { result: JsonValue },
    Failed { error: String },
}

impl TaskTransition {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskTransition::Processing { .. } => TaskStatus::Processing,
            TaskTransition::Completed { .. } => TaskStatus::Completed,
            TaskTransition::Failed { .. } => TaskStatus::Failed,
        }
    }
}

/// A transition tagged with the delivery attempt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub attempt: u32,
    pub transition: TaskTransition,
}

impl StatusUpdate {
    pub fn processing(attempt: u32, progress: Progress) -> Self {
        Self {
            attempt,
            transition: TaskTransition::Processing { progress },
        }
    }

    pub fn completed(attempt: u32, result: JsonValue) -> Self {
        Self {
            attempt,
            transition: TaskTransition::Completed { result },
        }
    }

    pub fn failed(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            transition: TaskTransition::Failed {
                error: error.into(),
            },
        }
    }
}

/// Why a status update was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("stale write from attempt {attempt}; task is on attempt {current}")]
    StaleAttempt { attempt: u32, current: u32 },

    #[error("illegal transition {from} -> {to} (attempt {attempt})")]
    Illegal {
        from: TaskStatus,
        to: TaskStatus,
        attempt: u32,
    },
}

/// Durable task record.
///
/// Fields are public for storage adapters; mutate through [`Task::apply`] so
/// the status graph and attempt fencing hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: Progress,
    /// Present only when `status == Completed`.
    pub result: Option<JsonValue>,
    /// Present only when `status == Failed`.
    pub error: Option<String>,
    /// Number of failed execution attempts.
    pub retries: u32,
    /// Delivery attempt that last wrote this record (0 while pending).
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(input: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            name: input.name,
            description: input.description,
            status: TaskStatus::Pending,
            progress: Progress::ZERO,
            result: None,
            error: None,
            retries: 0,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate and apply a status update in place.
    ///
    /// - writes from an older attempt are rejected as stale
    /// - a newer attempt may only open with `processing`, and never on a
    ///   completed task
    /// - within an attempt, only edges out of `processing` are accepted
    /// - `failed` bumps `retries` in the same write
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = update.transition.status();

        if update.attempt < self.attempt {
            return Err(TransitionError::StaleAttempt {
                attempt: update.attempt,
                current: self.attempt,
            });
        }

        let allowed = if update.attempt > self.attempt {
            next == TaskStatus::Processing && self.status.can_transition_to(next)
        } else {
            self.status == TaskStatus::Processing && self.status.can_transition_to(next)
        };

        if !allowed {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
                attempt: update.attempt,
            });
        }

        match &update.transition {
            TaskTransition::Processing { progress } => {
                self.progress = *progress;
                self.result = None;
                self.error = None;
            }
            TaskTransition::Completed { result } => {
                self.progress = Progress::COMPLETE;
                self.result = Some(result.clone());
                self.error = None;
            }
            TaskTransition::Failed { error } => {
                self.progress = Progress::ZERO;
                self.result = None;
                self.error = Some(error.clone());
                self.retries += 1;
            }
        }

        self.status = next;
        self.attempt = update.attempt;
        self.touch(now);
        Ok(())
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }

    pub fn to_dto(&self) -> TaskDto {
        TaskDto::from(self)
    }
}

/// External shape of a task (JSON, camelCase, RFC 3339 timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskDto {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            description: task.description.clone(),
            status: task.status,
            progress: task.progress,
            result: task.result.clone(),
            error: task.error.clone(),
            retries: task.retries,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn pending() -> Task {
        Task::new(NewTask::new("x", "ten-char-plus").unwrap(), Utc::now())
    }

    #[test]
    fn new_task_starts_pending() {
        let task = pending();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, Progress::ZERO);
        assert_eq!(task.retries, 0);
        assert_eq!(task.attempt, 0);
        assert!(task.result.is_none() && task.error.is_none());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn new_task_requires_non_blank_fields() {
        assert!(matches!(NewTask::new("  ", "desc"), Err(DomainError::Validation(_))));
        assert!(matches!(NewTask::new("name", ""), Err(DomainError::Validation(_))));

        let input = NewTask::new("  name ", " desc  ").unwrap();
        assert_eq!(input.name(), "name");
        assert_eq!(input.description(), "desc");
    }

    #[test]
    fn successful_attempt() {
        let mut task = pending();
        let now = Utc::now();

        task.apply(&StatusUpdate::processing(1, Progress::STARTED), now).unwrap();
        task.apply(&StatusUpdate::processing(1, Progress::clamped(52)), now).unwrap();
        task.apply(&StatusUpdate::completed(1, json!({"ok": true})), now).unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, Progress::COMPLETE);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.error.is_none());
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn failure_counts_retry_and_clears_result() {
        let mut task = pending();
        let now = Utc::now();

        task.apply(&StatusUpdate::processing(1, Progress::STARTED), now).unwrap();
        task.apply(&StatusUpdate::failed(1, "boom"), now).unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.result.is_none());
        assert_eq!(task.retries, 1);

        // Redelivery opens a new attempt.
        task.apply(&StatusUpdate::processing(2, Progress::STARTED), now).unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.error.is_none());
        assert_eq!(task.retries, 1);
    }

    #[test]
    fn failed_cannot_reopen_within_same_attempt() {
        let mut task = pending();
        let now = Utc::now();
        task.apply(&StatusUpdate::processing(1, Progress::STARTED), now).unwrap();
        task.apply(&StatusUpdate::failed(1, "boom"), now).unwrap();

        let err = task
            .apply(&StatusUpdate::processing(1, Progress::STARTED), now)
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: TaskStatus::Failed,
                to: TaskStatus::Processing,
                attempt: 1
            }
        );
    }

    #[test]
    fn completed_is_terminal() {
        let mut task = pending();
        let now = Utc::now();
        task.apply(&StatusUpdate::processing(1, Progress::STARTED), now).unwrap();
        task.apply(&StatusUpdate::completed(1, json!(1)), now).unwrap();

        let before = task.clone();
        assert!(task.apply(&StatusUpdate::processing(2, Progress::STARTED), now).is_err());
        assert!(task.apply(&StatusUpdate::failed(1, "late"), now).is_err());
        assert_eq!(task, before);
    }

    #[test]
    fn stale_attempt_is_rejected() {
        let mut task = pending();
        let now = Utc::now();
        task.apply(&StatusUpdate::processing(1, Progress::STARTED), now).unwrap();
        task.apply(&StatusUpdate::processing(2, Progress::STARTED), now).unwrap();

        let err = task
            .apply(&StatusUpdate::processing(1, Progress::clamped(90)), now)
            .unwrap_err();
        assert_eq!(err, TransitionError::StaleAttempt { attempt: 1, current: 2 });
        assert_eq!(task.progress, Progress::STARTED);
    }

    #[test]
    fn pending_cannot_jump_to_terminal() {
        let mut task = pending();
        let now = Utc::now();
        assert!(task.apply(&StatusUpdate::completed(1, json!(null)), now).is_err());
        assert!(task.apply(&StatusUpdate::failed(1, "x"), now).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut task = pending();
        let earlier = task.created_at - Duration::seconds(5);
        task.apply(&StatusUpdate::processing(1, Progress::STARTED), earlier).unwrap();
        assert_eq!(task.updated_at, task.created_at);
    }

    #[test]
    fn dto_uses_camel_case_and_omits_empty_outcome() {
        let task = pending();
        let value = serde_json::to_value(task.to_dto()).unwrap();

        assert_eq!(value["status"], "pending");
        assert_eq!(value["progress"], 0);
        assert_eq!(value["retries"], 0);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
        assert!(value.get("result").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    fn arb_update() -> impl Strategy<Value = StatusUpdate> {
        let transition = prop_oneof![
            (-50i64..200).prop_map(|p| TaskTransition::Processing {
                progress: Progress::clamped(p)
            }),
            Just(TaskTransition::Completed { result: json!({"n": 1}) }),
            "[a-z]{1,8}".prop_map(|error| TaskTransition::Failed { error }),
        ];
        (0u32..5, transition).prop_map(|(attempt, transition)| StatusUpdate { attempt, transition })
    }

    proptest! {
        #[test]
        fn clamped_progress_is_in_range(raw in any::<i64>()) {
            let p = Progress::clamped(raw);
            prop_assert!(p.value() <= 100);
        }

        #[test]
        fn invariants_hold_under_arbitrary_updates(updates in prop::collection::vec(arb_update(), 0..40)) {
            let mut task = pending();
            let mut prev = task.clone();
            let now = Utc::now();

            for update in &updates {
                let applied = task.apply(update, now).is_ok();

                prop_assert!(task.progress.value() <= 100);
                prop_assert!(!(task.result.is_some() && task.error.is_some()));
                prop_assert!(task.retries >= prev.retries);
                prop_assert!(task.attempt >= prev.attempt);
                prop_assert!(task.updated_at >= prev.updated_at);

                match task.status {
                    TaskStatus::Pending | TaskStatus::Processing => {
                        prop_assert!(task.result.is_none() && task.error.is_none());
                    }
                    TaskStatus::Completed => prop_assert!(task.result.is_some()),
                    TaskStatus::Failed => prop_assert!(task.error.is_some()),
                }

                if applied {
                    prop_assert!(prev.status.can_transition_to(task.status));
                    if task.status == TaskStatus::Failed {
                        prop_assert_eq!(task.retries, prev.retries + 1);
                    }
                } else {
                    prop_assert_eq!(&task, &prev);
                }
                prev = task.clone();
            }
        }
    }
}
