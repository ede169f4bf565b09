//! taskflow: a dependency-aware task orchestration engine.
//!
//! Clients describe work as tasks (a config, a priority and a set of
//! dependencies) and hand them to a [`Scheduler`]. The scheduler admits
//! tasks from the [`TaskPool`] once their dependencies have completed,
//! runs them cooperatively on one async loop, keeps their shared
//! [`Context`]s versioned in the [`ContextManager`] and mirrors every
//! lifecycle transition into the file-backed [`StateManager`].

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod protocols;
pub mod state;
pub mod util;

pub use config::{Config, PipelineConfig, SchedulerConfig, StateConfig};
pub use context::{Context, ContextId, ContextManager, DictDiff};
pub use crate::core::{
    DependencyGraph, Pipeline, PipelineId, Task, TaskBody, TaskConfig, TaskFactory, TaskId,
    TaskMetrics, TaskPriority, TaskRegistry, TaskResult, TaskState, TaskType,
};
pub use error::{Error, Result};
pub use orchestration::{RunReport, Scheduler, SchedulerEvent, TaskCounts, TaskPool};
pub use protocols::{ContextManagement, PoolManagement, StateManagement, TaskProtocol};
pub use state::{StateManager, StateRecord};
