//! Task data model for the orchestration engine.
//!
//! A `TaskConfig` is the immutable descriptor a client submits. A `Task`
//! wraps that descriptor with the mutable runtime state the pool and the
//! scheduler track (lifecycle state, metrics, retries) and with the body
//! that actually does the work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;
use crate::core::pipeline::PipelineId;
use crate::error::{Error, Result};
use crate::protocols::TaskProtocol;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a task.
///
/// `Created → Pending → Running → {Completed | Failed | RetryPending}`,
/// with `RetryPending → Running` for the next attempt and
/// `RetryPending → Failed` once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed but not yet admitted to a pool.
    Created,
    /// Waiting in the pool for dependencies, start time or capacity.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, or a dependency failed.
    Failed,
    /// Failed an attempt and waiting to be retried.
    RetryPending,
}

impl TaskState {
    /// Whether this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `Pending → Completed` covers tasks whose completion was recorded by a
    /// previous process and `Pending → Failed` covers dependency failures.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RetryPending)
                | (RetryPending, Running)
                | (RetryPending, Failed)
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::RetryPending => write!(f, "retry_pending"),
        }
    }
}

/// Base priority of a task. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric base score used by the pool.
    pub fn value(&self) -> i64 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 5,
            TaskPriority::High => 10,
            TaskPriority::Critical => 20,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Kind of work a task performs, used to pick an implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    File,
    Http,
    Processing,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::File => write!(f, "file"),
            TaskType::Http => write!(f, "http"),
            TaskType::Processing => write!(f, "processing"),
        }
    }
}

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Immutable task descriptor submitted by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique identifier for this task.
    #[serde(default)]
    pub id: TaskId,
    /// Kind of work, resolved to an implementation by the factory.
    pub task_type: TaskType,
    /// Base priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Tasks that must complete before this one may start.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Execution timeout in seconds. `None` uses the scheduler default.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Retries allowed after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The task must not start before this instant.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Type-specific configuration.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TaskConfig {
    /// Create a config with a fresh id and default settings.
    pub fn new(task_type: TaskType) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            start_time: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Check the descriptor against the clock `now`.
    ///
    /// # Errors
    /// Returns `TaskConfigValidation` if the start time is already in the
    /// past, the timeout is negative or not finite, or the dependency list
    /// contains the task itself or a duplicate.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(start) = self.start_time {
            if start < now {
                return Err(Error::TaskConfigValidation(format!(
                    "start_time {} for task {} is in the past",
                    start.to_rfc3339(),
                    self.id
                )));
            }
        }
        if let Some(timeout) = self.timeout {
            if !timeout.is_finite() || timeout < 0.0 {
                return Err(Error::TaskConfigValidation(format!(
                    "timeout must be a non-negative number of seconds, got {}",
                    timeout
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &self.dependencies {
            if *dep == self.id {
                return Err(Error::TaskConfigValidation(format!(
                    "task {} depends on itself",
                    self.id
                )));
            }
            if !seen.insert(dep) {
                return Err(Error::TaskConfigValidation(format!(
                    "duplicate dependency {} on task {}",
                    dep, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Runtime metrics for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Accumulated body run time in seconds across attempts.
    pub execution_time: f64,
    pub retry_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            execution_time: 0.0,
            retry_count: 0,
            error_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt.
    pub fn record_error(&mut self, message: &str) {
        self.error_count += 1;
        self.last_error = Some(message.to_string());
        self.touch();
    }
}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one task, reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn succeeded(task_id: TaskId, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            success: true,
            error: None,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
        }
    }

    /// A failure. `started_at` is `None` for tasks that never ran.
    pub fn failed(task_id: TaskId, started_at: Option<DateTime<Utc>>, error: &str) -> Self {
        Self {
            task_id,
            success: false,
            error: Some(error.to_string()),
            started_at,
            completed_at: Some(Utc::now()),
        }
    }

    /// Wall time of the final attempt in seconds, if it ran.
    pub fn execution_time(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            }
            _ => None,
        }
    }
}

/// The work a task performs.
///
/// Implementations mutate `context.data` and `context.results` as their side
/// effect. Every `.await` inside `execute` is a point where the scheduler
/// may advance other tasks.
pub trait TaskBody: Send + Sync {
    fn execute<'a>(
        &'a self,
        config: &'a TaskConfig,
        context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A task instance: a config plus runtime state and its body.
#[derive(Clone)]
pub struct Task {
    config: TaskConfig,
    state: TaskState,
    metrics: TaskMetrics,
    retry_count: u32,
    pipeline_id: Option<PipelineId>,
    body: Arc<dyn TaskBody>,
}

impl Task {
    /// Create a task in the `Created` state.
    ///
    /// # Errors
    /// Returns `TaskConfigValidation` if the config does not validate
    /// against the current time.
    pub fn new(config: TaskConfig, body: Arc<dyn TaskBody>) -> Result<Self> {
        config.validate(Utc::now())?;
        Ok(Self {
            config,
            state: TaskState::Created,
            metrics: TaskMetrics::new(),
            retry_count: 0,
            pipeline_id: None,
            body,
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn pipeline_id(&self) -> Option<PipelineId> {
        self.pipeline_id
    }

    /// Tag this task as part of a pipeline.
    pub fn set_pipeline(&mut self, pipeline_id: PipelineId) {
        self.pipeline_id = Some(pipeline_id);
    }

    /// Whether another attempt is allowed.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.config.max_retries
    }

    /// Count one more retry attempt.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.metrics.retry_count = self.retry_count;
        self.metrics.touch();
    }
}

impl TaskProtocol for Task {
    fn task_id(&self) -> TaskId {
        self.config.id
    }

    fn priority(&self) -> i64 {
        self.config.priority.value()
    }

    fn dependencies(&self) -> &[TaskId] {
        &self.config.dependencies
    }

    fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut TaskMetrics {
        &mut self.metrics
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.metrics.touch();
    }

    fn execute(&self, context: Context) -> BoxFuture<'static, (Context, Result<()>)> {
        let body = Arc::clone(&self.body);
        let config = self.config.clone();
        async move {
            let mut context = context;
            let result = body.execute(&config, &mut context).await;
            (context, result)
        }
        .boxed()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.config.id)
            .field("task_type", &self.config.task_type)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("pipeline_id", &self.pipeline_id)
            .finish()
    }
}
