//! `taskflow-core`: task lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the task record, its status graph and the external DTO.

pub mod error;
pub mod id;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::TaskId;
pub use task::{
    NewTask, Progress, StatusUpdate, Task, TaskDto, TaskStatus, TaskTransition, TransitionError,
};
