//! Capability traits at the seams between the scheduler and its components.
//!
//! The scheduler only talks to the task pool, the context manager and the
//! state manager through these traits, so any of them can be swapped for
//! another implementation (or a test double) without touching the loop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::context::{Context, ContextId};
use crate::core::pipeline::PipelineId;
use crate::core::task::{Task, TaskId, TaskMetrics, TaskState};
use crate::error::Result;
use crate::orchestration::pool::TaskCounts;
use crate::state::StateRecord;

/// What the pool and the scheduler need from a task.
pub trait TaskProtocol: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// Base priority score.
    fn priority(&self) -> i64;

    fn dependencies(&self) -> &[TaskId];

    fn metrics(&self) -> &TaskMetrics;

    fn metrics_mut(&mut self) -> &mut TaskMetrics;

    fn state(&self) -> TaskState;

    fn set_state(&mut self, state: TaskState);

    /// Run the task against `context`, handing the mutated context back
    /// together with the outcome.
    fn execute(&self, context: Context) -> BoxFuture<'static, (Context, Result<()>)>;
}

/// Admission control, ordering, dependency gating and lifecycle buckets.
pub trait PoolManagement: Send + Sync {
    /// Admit a task as pending.
    fn add_task(&self, task: Task) -> Result<()>;

    /// Move the best admissible pending task to running and return a copy.
    fn get_next_task(&self) -> Option<Task>;

    /// Move a running task to completed or failed based on its state.
    fn remove_task(&self, task_id: &TaskId) -> Result<()>;

    /// Change the state of a running task.
    fn transition(&self, task_id: &TaskId, state: TaskState) -> Result<()>;

    /// Record one finished attempt of a running task.
    fn record_attempt(&self, task_id: &TaskId, elapsed_secs: f64, error: Option<&str>) -> Result<()>;

    /// Put a running task back in the queue for another attempt, gated
    /// until `not_before` if given.
    fn requeue(&self, task_id: &TaskId, not_before: Option<DateTime<Utc>>) -> Result<()>;

    /// Fail every pending task with a failed dependency, transitively.
    ///
    /// Returns `(failed task, failed dependency)` pairs.
    fn fail_blocked(&self) -> Vec<(TaskId, TaskId)>;

    /// Treat a completion recorded elsewhere as resolved. A pending task
    /// with that id is completed without running. Returns true in that case.
    fn restore_completed(&self, task_id: &TaskId) -> bool;

    /// Cap concurrently running tasks of one pipeline.
    fn set_pipeline_limit(&self, pipeline_id: PipelineId, max_parallel: usize);

    /// Earliest instant a dependency-ready pending task becomes admissible
    /// by time, if any such task is currently time-gated.
    fn next_wakeup(&self) -> Option<DateTime<Utc>>;

    /// Purge completed and failed entries last updated before the cutoff.
    /// Returns the number purged.
    fn cleanup_completed(&self, older_than: DateTime<Utc>) -> usize;

    fn get_task(&self, task_id: &TaskId) -> Option<Task>;

    fn pending_tasks(&self) -> Vec<Task>;

    fn running_tasks(&self) -> Vec<Task>;

    fn task_counts(&self) -> TaskCounts;

    fn is_completed(&self, task_id: &TaskId) -> bool;

    fn is_failed(&self, task_id: &TaskId) -> bool;
}

/// Versioned, diff-audited execution contexts.
pub trait ContextManagement: Send + Sync {
    fn create_context(&self, pipeline_id: Option<PipelineId>) -> Context;

    fn get_context(&self, task_id: &TaskId) -> Result<Context>;

    fn get_context_by_id(&self, context_id: &ContextId) -> Result<Context>;

    fn get_pipeline_context(&self, pipeline_id: &PipelineId) -> Result<Context>;

    fn update_context(&self, context: Context) -> Result<()>;

    fn cleanup_context(&self, pipeline_id: &PipelineId) -> Result<()>;

    fn merge_contexts(&self, source: &Context, target: &Context) -> Context;

    fn associate_task(&self, task_id: TaskId, context_id: ContextId) -> Result<()>;
}

/// Durable task-state records.
pub trait StateManagement: Send + Sync {
    fn load(&self) -> Result<()>;

    fn save(&self) -> Result<()>;

    fn update(&self, task_id: TaskId, state: TaskState) -> Result<()>;

    fn get(&self, task_id: &TaskId) -> Result<StateRecord>;

    /// Drop records last updated before `before`. Returns how many.
    fn cleanup(&self, before: DateTime<Utc>) -> Result<usize>;

    fn records(&self) -> HashMap<TaskId, StateRecord>;
}
