//! Scheduler: the cooperative execution loop.
//!
//! The Scheduler registers tasks with the pool, binds each to an execution
//! context, and then drives them: it admits every task the pool hands out,
//! keeps their futures in one `FuturesUnordered`, and reacts to each one as
//! it finishes by completing it, requeueing it for another attempt, or
//! failing it. Task state is mirrored into the state manager at every
//! transition, and a session guard loads persisted state before the first
//! task runs and saves once when the run ends.
//!
//! State persistence locks and writes a file, so it never runs on the
//! loop: the session's load and save go through the blocking pool and
//! per-transition updates are handed to a writer thread in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, PipelineConfig, SchedulerConfig};
use crate::context::{diff_maps, Context, ContextId, ContextManager};
use crate::core::factory::TaskFactory;
use crate::core::pipeline::Pipeline;
use crate::core::task::{Task, TaskConfig, TaskId, TaskResult, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::pool::TaskPool;
use crate::protocols::{ContextManagement, PoolManagement, StateManagement, TaskProtocol};
use crate::state::StateManager;
use crate::util::blocking;

/// Attempts at writing a finished task's context changes back before
/// giving up on version conflicts.
const WRITE_BACK_ATTEMPTS: usize = 3;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components to follow a run without
/// polling the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A task moved to running. `attempt` starts at 1.
    TaskStarted { task_id: TaskId, attempt: u32 },
    /// A task completed successfully.
    TaskCompleted { task_id: TaskId },
    /// An attempt failed and the task was requeued.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
        not_before: Option<DateTime<Utc>>,
    },
    /// A task reached FAILED, either by exhausting its retries or because
    /// a dependency failed.
    TaskFailed { task_id: TaskId, error: String },
    /// Nothing is pending or running any more.
    AllTasksComplete,
}

/// Outcome of one `run`.
#[derive(Debug, Default)]
pub struct RunReport {
    /// One entry per task that reached a terminal state during the run.
    pub results: Vec<TaskResult>,
    /// Errors reported upward without aborting the loop.
    pub errors: Vec<Error>,
    /// Pending tasks that could never become admissible.
    pub stalled: Vec<TaskId>,
    /// Whether the run ended through `stop`.
    pub cancelled: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// True if every task finished successfully and nothing stalled.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.stalled.is_empty() && !self.cancelled
    }

    pub fn result(&self, task_id: &TaskId) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == *task_id)
    }

    /// Ids of the tasks that completed during the run.
    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.task_id)
            .collect()
    }
}

/// Load/save bracket around a run.
///
/// `begin` loads persisted state, restores completions recorded by a
/// previous process into the pool and records every pending task. The
/// state is saved exactly once: by `finish`, or on drop if `finish` was
/// never reached.
///
/// Both ends block on the state file; `Scheduler::run` calls them through
/// the blocking pool.
pub struct SchedulerSession {
    states: Arc<dyn StateManagement>,
    finished: bool,
}

impl SchedulerSession {
    pub fn begin(states: Arc<dyn StateManagement>, pool: &dyn PoolManagement) -> Result<Self> {
        states.load()?;
        let mut restored = 0;
        for (task_id, record) in states.records() {
            if record.state == TaskState::Completed && pool.restore_completed(&task_id) {
                restored += 1;
            }
        }
        for task in pool.pending_tasks() {
            states.update(task.task_id(), task.state())?;
        }
        info!(restored, pending = pool.task_counts().pending, "scheduler session started");
        Ok(Self {
            states,
            finished: false,
        })
    }

    /// Save and close the session.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        let result = self.states.save();
        info!(saved = result.is_ok(), "scheduler session finished");
        result
    }
}

impl Drop for SchedulerSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.states.save() {
            warn!(error = %e, "failed to save state while closing session");
        }
    }
}

/// Applies state transitions on a dedicated blocking thread, in the order
/// they were recorded.
struct StateWriter {
    tx: mpsc::UnboundedSender<(TaskId, TaskState)>,
    worker: tokio::task::JoinHandle<Vec<Error>>,
}

impl StateWriter {
    fn spawn(states: Arc<dyn StateManagement>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(TaskId, TaskState)>();
        let worker = tokio::task::spawn_blocking(move || {
            let mut errors = Vec::new();
            while let Some((task_id, state)) = rx.blocking_recv() {
                if let Err(e) = states.update(task_id, state) {
                    warn!(task_id = %task_id.short(), %state, error = %e, "failed to record task state");
                    errors.push(Error::scheduler("state update", e));
                }
            }
            errors
        });
        Self { tx, worker }
    }

    fn record(&self, task_id: TaskId, state: TaskState) {
        if self.tx.send((task_id, state)).is_err() {
            warn!(task_id = %task_id.short(), %state, "state writer gone, transition not recorded");
        }
    }

    /// Wait for every queued transition to be applied.
    async fn close(self) -> Vec<Error> {
        let Self { tx, worker } = self;
        drop(tx);
        match worker.await {
            Ok(errors) => errors,
            Err(e) => vec![Error::scheduler(
                "state update",
                Error::TaskJoin(e.to_string()),
            )],
        }
    }
}

/// A task execution that has run to an outcome.
struct Finished {
    task: Task,
    base: Context,
    context: Context,
    outcome: Result<()>,
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

/// Dependency-aware task scheduler.
///
/// # Example
///
/// ```ignore
/// use taskflow::{Config, Scheduler, TaskConfig, TaskRegistry, TaskType};
///
/// let mut registry = TaskRegistry::new();
/// registry.register(TaskType::Processing, |p: MyParams| Ok(MyBody::new(p)));
///
/// let scheduler = Scheduler::new(&Config::load()?)?.with_factory(Arc::new(registry));
/// let a = scheduler.schedule_task(TaskConfig::new(TaskType::Processing))?;
/// let report = scheduler.run().await?;
/// ```
pub struct Scheduler {
    config: SchedulerConfig,
    pipeline_config: PipelineConfig,
    pool: Arc<dyn PoolManagement>,
    contexts: Arc<dyn ContextManagement>,
    states: Arc<dyn StateManagement>,
    factory: Option<Arc<dyn TaskFactory>>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Build a scheduler with the default component implementations.
    ///
    /// # Errors
    /// Returns `Validation` if the configuration is out of range.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_components(
            config,
            Arc::new(TaskPool::new(&config.scheduler)),
            Arc::new(ContextManager::new()),
            Arc::new(StateManager::new(&config.state)?),
        ))
    }

    /// Build a scheduler around caller-supplied components.
    pub fn with_components(
        config: &Config,
        pool: Arc<dyn PoolManagement>,
        contexts: Arc<dyn ContextManagement>,
        states: Arc<dyn StateManagement>,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            pipeline_config: config.pipeline.clone(),
            pool,
            contexts,
            states,
            factory: None,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn TaskFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Emit lifecycle events on `tx`. Events are dropped when the channel
    /// is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn pool(&self) -> &Arc<dyn PoolManagement> {
        &self.pool
    }

    pub fn contexts(&self) -> &Arc<dyn ContextManagement> {
        &self.contexts
    }

    pub fn states(&self) -> &Arc<dyn StateManagement> {
        &self.states
    }

    /// Register a task and bind it to a context.
    ///
    /// Pipeline tasks share their pipeline's context; any other task gets
    /// a fresh one.
    ///
    /// # Errors
    /// Returns `Scheduler` wrapping the pool's `TaskPool` error on a
    /// duplicate id or a dependency cycle.
    pub fn add_task(&self, task: Task) -> Result<TaskId> {
        self.admit(task, "add_task")
    }

    /// Build a task through the factory and register it.
    ///
    /// # Errors
    /// Factory errors are returned as-is; pool errors are wrapped in
    /// `Scheduler`.
    pub fn schedule_task(&self, config: TaskConfig) -> Result<TaskId> {
        let factory = self.factory.as_ref().ok_or_else(|| {
            Error::TaskCreation("no task factory configured for this scheduler".to_string())
        })?;
        let task = factory.create_task(config)?;
        self.admit(task, "schedule_task")
    }

    /// A pipeline with the configured default parallelism.
    pub fn new_pipeline(&self, tasks: Vec<Task>) -> Result<Pipeline> {
        Pipeline::new(tasks, self.pipeline_config.max_parallel)
    }

    /// Register every task of a pipeline against one shared context.
    ///
    /// Tasks registered before a failing one stay registered.
    pub fn schedule_pipeline(&self, pipeline: Pipeline) -> Result<ContextId> {
        let Pipeline {
            id,
            tasks,
            max_parallel,
        } = pipeline;
        self.pool.set_pipeline_limit(id, max_parallel);
        let context = self.contexts.create_context(Some(id));
        let count = tasks.len();
        for mut task in tasks {
            task.set_pipeline(id);
            self.admit(task, "schedule_pipeline")?;
        }
        info!(pipeline = %id.short(), tasks = count, max_parallel, "pipeline scheduled");
        Ok(context.id)
    }

    /// Whether `task` could start right now: every dependency completed
    /// and the start time reached.
    pub fn can_execute(&self, task: &Task) -> bool {
        let deps_done = task
            .dependencies()
            .iter()
            .all(|d| self.pool.is_completed(d) && !self.pool.is_failed(d));
        let started = task
            .config()
            .start_time
            .map_or(true, |start| start <= Utc::now());
        deps_done && started
    }

    /// Ask a running loop to end. In-flight bodies are dropped and the
    /// session still saves. A stopped scheduler does not run again.
    pub fn stop(&self) {
        info!("scheduler stop requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run until nothing is pending or in flight, only unreachable tasks
    /// remain, or `stop` is called.
    ///
    /// # Errors
    /// Returns `Scheduler` if persisted state cannot be loaded at the start
    /// or saved at the end. Task failures are reported in the `RunReport`.
    pub async fn run(&self) -> Result<RunReport> {
        let states = Arc::clone(&self.states);
        let pool = Arc::clone(&self.pool);
        let session = blocking(move || SchedulerSession::begin(states, pool.as_ref()))
            .await
            .map_err(|e| Error::scheduler("run", e))?;

        let mut report = RunReport::default();
        let writer = StateWriter::spawn(Arc::clone(&self.states));
        self.drive(&writer, &mut report).await;
        report.errors.extend(writer.close().await);

        blocking(move || session.finish())
            .await
            .map_err(|e| Error::scheduler("run", e))?;
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            stalled = report.stalled.len(),
            "run finished"
        );
        Ok(report)
    }

    fn admit(&self, task: Task, operation: &str) -> Result<TaskId> {
        let task_id = task.task_id();
        let pipeline_id = task.pipeline_id();
        self.pool
            .add_task(task)
            .map_err(|e| Error::scheduler(operation, e))?;

        let context_id = match pipeline_id.map(|p| self.contexts.get_pipeline_context(&p)) {
            Some(Ok(context)) => context.id,
            _ => self.contexts.create_context(pipeline_id).id,
        };
        self.contexts
            .associate_task(task_id, context_id)
            .map_err(|e| Error::scheduler(operation, e))?;
        debug!(task_id = %task_id.short(), context = %context_id, "task registered");
        Ok(task_id)
    }

    async fn drive(&self, writer: &StateWriter, report: &mut RunReport) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Finished>> =
            FuturesUnordered::new();
        let check_interval = self.config.state_check_interval();
        let cleanup_interval = self.config.cleanup_interval();
        let mut last_cleanup = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            self.fail_blocked(writer, report);
            self.start_ready(&mut in_flight, writer, report);

            let mut tick = check_interval;
            if in_flight.is_empty() {
                if self.pool.task_counts().pending == 0 {
                    self.emit(SchedulerEvent::AllTasksComplete);
                    break;
                }
                match self.pool.next_wakeup() {
                    Some(at) => {
                        let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tick = tick.min(until);
                    }
                    None => {
                        report.stalled = self
                            .pool
                            .pending_tasks()
                            .iter()
                            .map(|t| t.task_id())
                            .collect();
                        warn!(count = report.stalled.len(), "pending tasks can never run");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(in_flight = in_flight.len(), "scheduler stopped");
                    report.cancelled = true;
                    break;
                }
                Some(finished) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle_finished(finished, writer, report);
                }
                _ = tokio::time::sleep(tick) => {}
            }

            if let Some(every) = cleanup_interval {
                if last_cleanup.elapsed() >= every {
                    self.cleanup(every);
                    last_cleanup = Instant::now();
                }
            }
        }
    }

    /// Fail pending tasks whose dependencies failed.
    fn fail_blocked(&self, writer: &StateWriter, report: &mut RunReport) {
        for (task_id, dependency) in self.pool.fail_blocked() {
            let message = format!("dependency {} failed", dependency);
            debug!(task_id = %task_id.short(), dependency = %dependency.short(), "task failed by dependency");
            writer.record(task_id, TaskState::Failed);
            self.emit(SchedulerEvent::TaskFailed {
                task_id,
                error: message.clone(),
            });
            report.results.push(TaskResult::failed(task_id, None, &message));
        }
    }

    /// Admit tasks until the pool has nothing more to give.
    fn start_ready(
        &self,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Finished>>,
        writer: &StateWriter,
        report: &mut RunReport,
    ) {
        while let Some(task) = self.pool.get_next_task() {
            let task_id = task.task_id();
            let context = match self.context_for(&task) {
                Ok(context) => context,
                Err(e) => {
                    report.errors.push(Error::scheduler("run", e));
                    Context::new(task.pipeline_id())
                }
            };
            let attempt = task.retry_count() + 1;
            writer.record(task_id, TaskState::Running);
            self.emit(SchedulerEvent::TaskStarted { task_id, attempt });
            debug!(task_id = %task_id.short(), attempt, "task started");

            let limit = self.config.task_timeout(task.config().timeout);
            let base = context.clone();
            let execution = task.execute(context);
            let started_at = Utc::now();
            in_flight.push(
                async move {
                    let clock = Instant::now();
                    let (context, outcome) = match limit {
                        Some(limit) => match tokio::time::timeout(limit, execution).await {
                            Ok(pair) => pair,
                            Err(_) => (base.clone(), Err(Error::Timeout(limit))),
                        },
                        None => execution.await,
                    };
                    Finished {
                        task,
                        base,
                        context,
                        outcome,
                        started_at,
                        elapsed: clock.elapsed(),
                    }
                }
                .boxed(),
            );
        }
    }

    /// The context bound to a task, binding a fresh one if the task was
    /// put in the pool directly.
    fn context_for(&self, task: &Task) -> Result<Context> {
        match self.contexts.get_context(&task.task_id()) {
            Ok(context) => Ok(context),
            Err(Error::ContextNotFound(_)) => {
                let pipeline_context = task
                    .pipeline_id()
                    .map(|p| self.contexts.get_pipeline_context(&p));
                let context = match pipeline_context {
                    Some(Ok(context)) => context,
                    _ => self.contexts.create_context(task.pipeline_id()),
                };
                self.contexts.associate_task(task.task_id(), context.id)?;
                self.contexts.get_context_by_id(&context.id)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_finished(&self, finished: Finished, writer: &StateWriter, report: &mut RunReport) {
        let Finished {
            task,
            base,
            context,
            outcome,
            started_at,
            elapsed,
        } = finished;
        let task_id = task.task_id();
        let elapsed_secs = elapsed.as_secs_f64();

        match outcome {
            Ok(()) => {
                self.check(report, self.pool.record_attempt(&task_id, elapsed_secs, None));
                if let Err(e) = self.write_back(&base, &context) {
                    warn!(task_id = %task_id.short(), error = %e, "context changes not stored");
                    report.errors.push(Error::scheduler("context write-back", e));
                }
                self.check(report, self.pool.transition(&task_id, TaskState::Completed));
                self.check(report, self.pool.remove_task(&task_id));
                writer.record(task_id, TaskState::Completed);
                debug!(task_id = %task_id.short(), elapsed_secs, "task completed");
                self.emit(SchedulerEvent::TaskCompleted { task_id });
                report.results.push(TaskResult::succeeded(task_id, started_at));
            }
            Err(err) => {
                let message = err.to_string();
                self.check(
                    report,
                    self.pool.record_attempt(&task_id, elapsed_secs, Some(&message)),
                );
                if task.has_retries_left() {
                    let attempt = task.retry_count() + 1;
                    let delay = self.config.retry_backoff(attempt);
                    let not_before = if delay.is_zero() {
                        None
                    } else {
                        let until = chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|d| Utc::now().checked_add_signed(d));
                        Some(until.unwrap_or(DateTime::<Utc>::MAX_UTC))
                    };
                    self.check(report, self.pool.transition(&task_id, TaskState::RetryPending));
                    self.check(report, self.pool.requeue(&task_id, not_before));
                    writer.record(task_id, TaskState::RetryPending);
                    warn!(
                        task_id = %task_id.short(),
                        attempt,
                        max_retries = task.config().max_retries,
                        error = %message,
                        "task attempt failed, retrying"
                    );
                    self.emit(SchedulerEvent::TaskRetrying {
                        task_id,
                        attempt,
                        error: message,
                        not_before,
                    });
                } else {
                    self.check(report, self.pool.transition(&task_id, TaskState::Failed));
                    self.check(report, self.pool.remove_task(&task_id));
                    writer.record(task_id, TaskState::Failed);
                    let failure = Error::TaskMaxRetries {
                        task_id,
                        retries: task.retry_count(),
                    };
                    warn!(task_id = %task_id.short(), error = %message, "task failed");
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id,
                        error: failure.to_string(),
                    });
                    report
                        .results
                        .push(TaskResult::failed(task_id, Some(started_at), &message));
                    report.errors.push(failure);
                }
            }
        }
    }

    /// Apply what a body changed in its copy of the context to the latest
    /// stored version.
    ///
    /// Only keys the body touched are written, so concurrent pipeline tasks
    /// do not overwrite each other's unrelated keys.
    fn write_back(&self, base: &Context, after: &Context) -> Result<()> {
        let data = diff_maps(&base.data, &after.data);
        let results = diff_maps(&base.results, &after.results);
        if data.is_empty() && results.is_empty() {
            return Ok(());
        }

        let mut last_error = None;
        for _ in 0..WRITE_BACK_ATTEMPTS {
            let mut latest = self.contexts.get_context_by_id(&after.id)?;
            data.apply(&mut latest.data);
            results.apply(&mut latest.results);
            latest.bump_version();
            match self.contexts.update_context(latest) {
                Ok(()) => return Ok(()),
                Err(e @ Error::ContextVersion { .. }) => {
                    trace!(context = %after.id, error = %e, "context write-back conflict");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::ContextNotFound(format!("context {}", after.id))
        }))
    }

    /// Purge old finished entries from the pool.
    ///
    /// Persisted records are left alone: they are what lets a restarted
    /// process skip completed work. Pruning them is up to the caller
    /// through `StateManagement::cleanup`.
    fn cleanup(&self, every: Duration) {
        let Ok(age) = chrono::Duration::from_std(every) else {
            return;
        };
        let cutoff = Utc::now() - age;
        let purged = self.pool.cleanup_completed(cutoff);
        debug!(purged, "periodic pool cleanup");
    }

    fn check(&self, report: &mut RunReport, result: Result<()>) {
        if let Err(e) = result {
            warn!(error = %e, "task pool rejected a lifecycle step");
            report.errors.push(Error::scheduler("run", e));
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                trace!(error = %e, "scheduler event dropped");
            }
        }
    }
}
