//! Orchestration layer: the task pool and the scheduler that drives it.

pub mod pool;
pub mod scheduler;

pub use pool::{ExecutionPriority, TaskCounts, TaskPool};
pub use scheduler::{RunReport, Scheduler, SchedulerEvent, SchedulerSession};
