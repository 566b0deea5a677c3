//! Infrastructure layer: task stores, job queues, workers, config.

pub mod config;
pub mod jobs;
pub mod service;
pub mod task_store;
pub mod workers;

mod integration_tests;

pub use config::{AppConfig, ConfigError};
pub use service::{ServiceError, TaskService};
