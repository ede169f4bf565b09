//! Core domain models for taskflow.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: task descriptors and instances, pipelines, the dependency
//! graph, and the task factory.

pub mod dag;
pub mod factory;
pub mod pipeline;
pub mod task;

pub use dag::DependencyGraph;
pub use factory::{TaskFactory, TaskRegistry};
pub use pipeline::{Pipeline, PipelineId};
pub use task::{
    Task, TaskBody, TaskConfig, TaskId, TaskMetrics, TaskPriority, TaskResult, TaskState,
    TaskType,
};
