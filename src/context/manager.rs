//! ContextManager - in-memory store of versioned contexts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use tracing::debug;

use super::{diff_maps, ChangeSet, Context, ContextId, VersionHistory};
use crate::core::pipeline::PipelineId;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::protocols::ContextManagement;

#[derive(Debug, Default)]
struct ContextStore {
    contexts: HashMap<ContextId, Context>,
    task_contexts: HashMap<TaskId, ContextId>,
    pipeline_contexts: HashMap<PipelineId, ContextId>,
}

/// Owns every context plus the task and pipeline indices into them.
///
/// All operations take one mutex. Contexts handed out are clones, so the
/// only way to change a stored context is `update_context` or
/// `merge_contexts`.
#[derive(Debug, Default)]
pub struct ContextManager {
    store: Mutex<ContextStore>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ContextStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    #[cfg(test)]
    fn context_id_for(&self, task_id: &TaskId) -> Option<ContextId> {
        self.lock().task_contexts.get(task_id).copied()
    }
}

impl ContextManagement for ContextManager {
    fn create_context(&self, pipeline_id: Option<PipelineId>) -> Context {
        let context = Context::new(pipeline_id);
        let mut store = self.lock();
        if let Some(pipeline_id) = pipeline_id {
            store.pipeline_contexts.insert(pipeline_id, context.id);
        }
        store.contexts.insert(context.id, context.clone());
        debug!(context = %context.id, ?pipeline_id, "context created");
        context
    }

    fn get_context(&self, task_id: &TaskId) -> Result<Context> {
        let store = self.lock();
        store
            .task_contexts
            .get(task_id)
            .and_then(|id| store.contexts.get(id))
            .cloned()
            .ok_or_else(|| Error::ContextNotFound(format!("no context for task {}", task_id)))
    }

    fn get_context_by_id(&self, context_id: &ContextId) -> Result<Context> {
        self.lock()
            .contexts
            .get(context_id)
            .cloned()
            .ok_or_else(|| Error::ContextNotFound(format!("context {}", context_id)))
    }

    fn get_pipeline_context(&self, pipeline_id: &PipelineId) -> Result<Context> {
        let store = self.lock();
        store
            .pipeline_contexts
            .get(pipeline_id)
            .and_then(|id| store.contexts.get(id))
            .cloned()
            .ok_or_else(|| {
                Error::ContextNotFound(format!("no context for pipeline {}", pipeline_id))
            })
    }

    fn update_context(&self, mut context: Context) -> Result<()> {
        let mut store = self.lock();
        let existing = store
            .contexts
            .get(&context.id)
            .ok_or_else(|| Error::ContextNotFound(format!("context {}", context.id)))?;

        if context.version <= existing.version {
            return Err(Error::ContextVersion {
                current: existing.version,
                provided: context.version,
            });
        }

        let changes = ChangeSet {
            data: diff_maps(&existing.data, &context.data),
            results: diff_maps(&existing.results, &context.results),
            metadata: diff_maps(
                &existing.metadata.as_diffable(),
                &context.metadata.as_diffable(),
            ),
        };
        let now = Utc::now();

        // History is append-only: keep the stored trail even if the caller
        // sent a truncated copy.
        let mut history = existing.metadata.version_history.clone();
        history.push(VersionHistory {
            version: existing.version,
            timestamp: now,
            changes,
        });
        context.metadata.version_history = history;

        let floor = existing.metadata.updated_at + Duration::microseconds(1);
        context.metadata.updated_at = if now > floor { now } else { floor };

        debug!(
            context = %context.id,
            from = existing.version,
            to = context.version,
            "context updated"
        );
        store.contexts.insert(context.id, context);
        Ok(())
    }

    fn cleanup_context(&self, pipeline_id: &PipelineId) -> Result<()> {
        let mut store = self.lock();
        let context_id = store.pipeline_contexts.remove(pipeline_id).ok_or_else(|| {
            Error::ContextNotFound(format!("no context for pipeline {}", pipeline_id))
        })?;
        store.contexts.remove(&context_id);
        store.task_contexts.retain(|_, id| *id != context_id);
        debug!(context = %context_id, pipeline = %pipeline_id, "context removed");
        Ok(())
    }

    fn merge_contexts(&self, source: &Context, target: &Context) -> Context {
        let mut store = self.lock();
        let mut merged = target.clone();
        merged
            .data
            .extend(source.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .results
            .extend(source.results.iter().map(|(k, v)| (k.clone(), v.clone())));

        let now = Utc::now();
        merged.metadata.merged_from = Some(source.id);
        merged.metadata.merged_at = Some(now);
        merged.metadata.source_version = Some(source.version);
        merged.metadata.updated_at = now;

        let stored_version = store
            .contexts
            .get(&target.id)
            .map(|c| c.version)
            .unwrap_or(0);
        merged.version = target.version.max(stored_version) + 1;

        debug!(
            source = %source.id,
            target = %target.id,
            version = merged.version,
            "contexts merged"
        );
        store.contexts.insert(merged.id, merged.clone());
        merged
    }

    fn associate_task(&self, task_id: TaskId, context_id: ContextId) -> Result<()> {
        let mut store = self.lock();
        let context = store
            .contexts
            .get_mut(&context_id)
            .ok_or_else(|| Error::ContextNotFound(format!("context {}", context_id)))?;
        context.metadata.associated_tasks.push(task_id);
        store.task_contexts.insert(task_id, context_id);
        Ok(())
    }
}
