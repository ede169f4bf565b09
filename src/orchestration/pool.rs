//! Task pool: admission control, priority ordering and lifecycle buckets.
//!
//! The `TaskPool` owns every task the scheduler knows about. Tasks wait in a
//! priority queue until their dependencies have completed, their start time
//! has passed and there is a free running slot. The effective score of a
//! queued task grows with the time it has waited and the retries it has
//! burned, so low-priority work cannot be starved indefinitely.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::core::dag::DependencyGraph;
use crate::core::pipeline::PipelineId;
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::protocols::{PoolManagement, TaskProtocol};

/// Number of tasks in each lifecycle bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Weights of the dynamic score:
/// `base + wait_seconds * wait_time_weight + retries * retry_weight`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionPriority {
    pub wait_time_weight: f64,
    pub retry_weight: f64,
}

impl ExecutionPriority {
    pub fn score(&self, base: i64, wait_secs: f64, retries: u32) -> f64 {
        base as f64 + wait_secs.max(0.0) * self.wait_time_weight + retries as f64 * self.retry_weight
    }
}

impl From<&SchedulerConfig> for ExecutionPriority {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            wait_time_weight: config.wait_time_weight,
            retry_weight: config.retry_weight,
        }
    }
}

/// A queued task. Higher score first; equal scores go out in enqueue order.
#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: TaskId,
    score: f64,
    sequence: u64,
    enqueued_at: DateTime<Utc>,
    not_before: Option<DateTime<Utc>>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct PoolInner {
    queue: BinaryHeap<QueueEntry>,
    pending: HashMap<TaskId, Task>,
    running: HashMap<TaskId, Task>,
    completed: HashMap<TaskId, Task>,
    failed: HashMap<TaskId, Task>,
    graph: DependencyGraph,
    /// Completions known without a task in the completed bucket: restored
    /// from a previous run or purged by cleanup.
    resolved: HashSet<TaskId>,
    /// Failed tasks purged by cleanup.
    purged_failed: HashSet<TaskId>,
    pipeline_limits: HashMap<PipelineId, usize>,
    /// Original queue position of running tasks, kept for requeue.
    admitted: HashMap<TaskId, (u64, DateTime<Utc>)>,
    next_sequence: u64,
}

impl PoolInner {
    fn contains(&self, id: &TaskId) -> bool {
        self.pending.contains_key(id)
            || self.running.contains_key(id)
            || self.completed.contains_key(id)
            || self.failed.contains_key(id)
    }

    fn has_failed(&self, id: &TaskId) -> bool {
        self.failed.contains_key(id) || self.purged_failed.contains(id)
    }

    fn has_completed(&self, id: &TaskId) -> bool {
        self.completed.contains_key(id) || self.resolved.contains(id)
    }

    fn running_in_pipeline(&self, pipeline_id: &PipelineId) -> usize {
        self.running
            .values()
            .filter(|t| t.pipeline_id().as_ref() == Some(pipeline_id))
            .count()
    }

    /// Earliest instant the entry may start, if later than `now`.
    fn gated_until(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self
            .pending
            .get(&entry.task_id)
            .and_then(|t| t.config().start_time);
        let gate = match (start, entry.not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        gate.filter(|g| *g > now)
    }

    fn admissible(&self, entry: &QueueEntry, now: DateTime<Utc>) -> bool {
        let Some(task) = self.pending.get(&entry.task_id) else {
            return false;
        };
        if !self.graph.is_ready(&entry.task_id) || self.gated_until(entry, now).is_some() {
            return false;
        }
        match task.pipeline_id() {
            Some(pipeline_id) => {
                let limit = self.pipeline_limits.get(&pipeline_id).copied().unwrap_or(usize::MAX);
                self.running_in_pipeline(&pipeline_id) < limit
            }
            None => true,
        }
    }

    fn drop_from_queue(&mut self, id: &TaskId) {
        self.queue.retain(|e| e.task_id != *id);
    }
}

/// Thread-safe task pool.
pub struct TaskPool {
    max_concurrent_tasks: usize,
    weights: ExecutionPriority,
    inner: Mutex<PoolInner>,
}

impl TaskPool {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            weights: ExecutionPriority::from(config),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another task may move to running.
    #[cfg(test)]
    fn has_capacity(&self) -> bool {
        self.lock().running.len() < self.max_concurrent_tasks
    }

    /// `add_task` with an explicit enqueue time.
    pub fn add_task_at(&self, mut task: Task, now: DateTime<Utc>) -> Result<()> {
        let id = task.task_id();
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.contains(&id) {
            return Err(Error::TaskPool(format!("Task {} already exists in pool", id)));
        }

        let deps = task.dependencies().to_vec();
        let PoolInner {
            graph,
            completed,
            resolved,
            ..
        } = &mut *inner;
        graph.add_task(id, &deps, |d| completed.contains_key(d) || resolved.contains(d))?;

        task.set_state(TaskState::Pending);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.queue.push(QueueEntry {
            task_id: id,
            score: task.priority() as f64,
            sequence,
            enqueued_at: now,
            not_before: None,
        });
        inner.pending.insert(id, task);
        debug!(task_id = %id.short(), sequence, "task added to pool");
        Ok(())
    }

    /// `get_next_task` evaluated at `now`.
    ///
    /// Rescores the whole queue, then pops entries until one is admissible.
    /// Skipped entries go back with their new scores.
    pub fn get_next_task_at(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.running.len() >= self.max_concurrent_tasks {
            return None;
        }

        let mut entries: Vec<QueueEntry> = inner.queue.drain().collect();
        for entry in &mut entries {
            if let Some(task) = inner.pending.get(&entry.task_id) {
                let waited = (now - entry.enqueued_at).num_milliseconds() as f64 / 1000.0;
                entry.score = self.weights.score(task.priority(), waited, task.retry_count());
            }
        }
        inner.queue = entries.into_iter().collect();

        let mut skipped = Vec::new();
        let mut chosen = None;
        while let Some(entry) = inner.queue.pop() {
            if inner.admissible(&entry, now) {
                chosen = Some(entry);
                break;
            }
            skipped.push(entry);
        }
        inner.queue.extend(skipped);

        let entry = chosen?;
        let mut task = inner.pending.remove(&entry.task_id)?;
        task.set_state(TaskState::Running);
        trace!(task_id = %entry.task_id.short(), score = entry.score, "task admitted");
        inner
            .admitted
            .insert(entry.task_id, (entry.sequence, entry.enqueued_at));
        inner.running.insert(entry.task_id, task.clone());
        Some(task)
    }

    /// `next_wakeup` evaluated at `now`.
    pub fn next_wakeup_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let inner = self.lock();
        inner
            .queue
            .iter()
            .filter(|e| inner.graph.is_ready(&e.task_id))
            .filter_map(|e| inner.gated_until(e, now))
            .min()
    }
}

impl PoolManagement for TaskPool {
    fn add_task(&self, task: Task) -> Result<()> {
        self.add_task_at(task, Utc::now())
    }

    fn get_next_task(&self) -> Option<Task> {
        self.get_next_task_at(Utc::now())
    }

    fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        let mut inner = self.lock();
        let mut task = inner
            .running
            .remove(task_id)
            .ok_or_else(|| Error::TaskPool(format!("Task {} is not running", task_id)))?;
        inner.admitted.remove(task_id);

        if task.state() == TaskState::Completed {
            let ready = inner.graph.resolve(task_id);
            if !ready.is_empty() {
                debug!(task_id = %task_id.short(), unblocked = ready.len(), "dependents unblocked");
            }
            inner.graph.release(task_id);
            inner.completed.insert(*task_id, task);
        } else {
            if task.state() != TaskState::Failed {
                task.set_state(TaskState::Failed);
            }
            inner.graph.release(task_id);
            inner.failed.insert(*task_id, task);
        }
        Ok(())
    }

    fn transition(&self, task_id: &TaskId, state: TaskState) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .running
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskPool(format!("Task {} is not running", task_id)))?;
        if task.state() != state && !task.state().can_transition_to(state) {
            return Err(Error::TaskPool(format!(
                "Task {} cannot move from {} to {}",
                task_id,
                task.state(),
                state
            )));
        }
        task.set_state(state);
        Ok(())
    }

    fn record_attempt(&self, task_id: &TaskId, elapsed_secs: f64, error: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .running
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskPool(format!("Task {} is not running", task_id)))?;
        let metrics = task.metrics_mut();
        metrics.execution_time += elapsed_secs.max(0.0);
        match error {
            Some(message) => metrics.record_error(message),
            None => metrics.touch(),
        }
        Ok(())
    }

    fn requeue(&self, task_id: &TaskId, not_before: Option<DateTime<Utc>>) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut task = inner
            .running
            .remove(task_id)
            .ok_or_else(|| Error::TaskPool(format!("Task {} is not running", task_id)))?;
        task.record_retry();
        task.set_state(TaskState::RetryPending);

        let (sequence, enqueued_at) = match inner.admitted.remove(task_id) {
            Some(position) => position,
            None => {
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                (sequence, Utc::now())
            }
        };
        inner.queue.push(QueueEntry {
            task_id: *task_id,
            score: task.priority() as f64,
            sequence,
            enqueued_at,
            not_before,
        });
        debug!(task_id = %task_id.short(), retry = task.retry_count(), "task requeued");
        inner.pending.insert(*task_id, task);
        Ok(())
    }

    fn fail_blocked(&self) -> Vec<(TaskId, TaskId)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut failed = Vec::new();
        loop {
            let blocked: Vec<(TaskId, TaskId)> = inner
                .pending
                .values()
                .filter_map(|t| {
                    t.dependencies()
                        .iter()
                        .find(|d| inner.has_failed(d))
                        .map(|d| (t.task_id(), *d))
                })
                .collect();
            if blocked.is_empty() {
                break;
            }
            for (id, dependency) in blocked {
                if let Some(mut task) = inner.pending.remove(&id) {
                    task.set_state(TaskState::Failed);
                    task.metrics_mut()
                        .record_error(&format!("dependency {} failed", dependency));
                    inner.graph.release(&id);
                    inner.failed.insert(id, task);
                    failed.push((id, dependency));
                }
            }
        }
        if !failed.is_empty() {
            let gone: HashSet<TaskId> = failed.iter().map(|(id, _)| *id).collect();
            inner.queue.retain(|e| !gone.contains(&e.task_id));
            debug!(count = failed.len(), "pending tasks failed by dependency");
        }
        failed
    }

    fn restore_completed(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        inner.resolved.insert(*task_id);
        inner.graph.resolve(task_id);
        match inner.pending.remove(task_id) {
            Some(mut task) => {
                task.set_state(TaskState::Completed);
                inner.graph.release(task_id);
                inner.drop_from_queue(task_id);
                inner.completed.insert(*task_id, task);
                debug!(task_id = %task_id.short(), "completion restored from state");
                true
            }
            None => false,
        }
    }

    fn set_pipeline_limit(&self, pipeline_id: PipelineId, max_parallel: usize) {
        self.lock()
            .pipeline_limits
            .insert(pipeline_id, max_parallel.max(1));
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.next_wakeup_at(Utc::now())
    }

    fn cleanup_completed(&self, older_than: DateTime<Utc>) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let old_completed: Vec<TaskId> = inner
            .completed
            .iter()
            .filter(|(_, t)| t.metrics().updated_at < older_than)
            .map(|(id, _)| *id)
            .collect();
        let old_failed: Vec<TaskId> = inner
            .failed
            .iter()
            .filter(|(_, t)| t.metrics().updated_at < older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &old_completed {
            inner.completed.remove(id);
            inner.resolved.insert(*id);
        }
        for id in &old_failed {
            inner.failed.remove(id);
            inner.purged_failed.insert(*id);
        }
        let purged = old_completed.len() + old_failed.len();
        if purged > 0 {
            debug!(purged, "finished tasks purged from pool");
        }
        purged
    }

    fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        let inner = self.lock();
        inner
            .pending
            .get(task_id)
            .or_else(|| inner.running.get(task_id))
            .or_else(|| inner.completed.get(task_id))
            .or_else(|| inner.failed.get(task_id))
            .cloned()
    }

    /// Pending tasks in current queue order (scores as of the last dequeue).
    fn pending_tasks(&self) -> Vec<Task> {
        let inner = self.lock();
        let mut entries: Vec<&QueueEntry> = inner.queue.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .filter_map(|e| inner.pending.get(&e.task_id).cloned())
            .collect()
    }

    fn running_tasks(&self) -> Vec<Task> {
        self.lock().running.values().cloned().collect()
    }

    fn task_counts(&self) -> TaskCounts {
        let inner = self.lock();
        TaskCounts {
            pending: inner.pending.len(),
            running: inner.running.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
        }
    }

    fn is_completed(&self, task_id: &TaskId) -> bool {
        self.lock().has_completed(task_id)
    }

    fn is_failed(&self, task_id: &TaskId) -> bool {
        self.lock().has_failed(task_id)
    }
}
