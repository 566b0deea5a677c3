//! Background workers.
//!
//! - `WorkFn`: the pluggable unit of work (`SimulatedWork` by default)
//! - `StatusProjector`: turns worker milestones into task status writes
//! - `WorkerPool`: dequeues jobs, runs them, settles them with the queue

pub mod pool;
pub mod projector;
pub mod work;

pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use projector::StatusProjector;
pub use work::{SimulatedWork, WorkError, WorkFn};
