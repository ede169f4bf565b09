//! Versioned execution contexts.
//!
//! A `Context` is the scratch space tasks read and write while they run.
//! Every accepted update carries a strictly greater `version` and leaves a
//! `VersionHistory` entry describing what changed, so the full evolution of
//! a context can be audited after the fact.

pub mod diff;
pub mod manager;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::pipeline::PipelineId;
use crate::core::task::TaskId;

pub use diff::{diff_maps, DictDiff, ModifiedValue};
pub use manager::ContextManager;

/// Free-form JSON key-value map.
pub type JsonMap = BTreeMap<String, Value>;

/// Unique identifier for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Changes recorded by one accepted update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub data: DictDiff,
    pub results: DictDiff,
    pub metadata: DictDiff,
}

/// One entry of a context's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Version that was replaced.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub changes: ChangeSet,
}

/// Bookkeeping attached to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only audit trail of accepted updates.
    pub version_history: Vec<VersionHistory>,
    pub pipeline_id: Option<PipelineId>,
    /// Tasks bound to this context, in association order.
    pub associated_tasks: Vec<TaskId>,
    pub merged_from: Option<ContextId>,
    pub merged_at: Option<DateTime<Utc>>,
    pub source_version: Option<u64>,
}

impl ContextMetadata {
    fn new(pipeline_id: Option<PipelineId>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            version_history: Vec::new(),
            pipeline_id,
            associated_tasks: Vec::new(),
            merged_from: None,
            merged_at: None,
            source_version: None,
        }
    }

    /// Metadata as a JSON map without the history field, for diffing.
    pub(crate) fn as_diffable(&self) -> JsonMap {
        let mut map: JsonMap = match serde_json::to_value(self) {
            Ok(Value::Object(object)) => object.into_iter().collect(),
            _ => JsonMap::new(),
        };
        map.remove("version_history");
        map
    }
}

/// Execution context shared by a task or by all tasks of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub pipeline_id: Option<PipelineId>,
    /// Working state.
    pub data: JsonMap,
    /// Task outputs keyed by task id.
    pub results: JsonMap,
    pub metadata: ContextMetadata,
    /// Starts at 1 and strictly increases with every stored change.
    pub version: u64,
}

impl Context {
    /// A fresh context at version 1.
    pub fn new(pipeline_id: Option<PipelineId>) -> Self {
        Self {
            id: ContextId::new(),
            pipeline_id,
            data: JsonMap::new(),
            results: JsonMap::new(),
            metadata: ContextMetadata::new(pipeline_id),
            version: 1,
        }
    }

    /// Store a task's output.
    pub fn set_result(&mut self, task_id: TaskId, value: Value) {
        self.results.insert(task_id.to_string(), value);
    }

    pub fn result(&self, task_id: &TaskId) -> Option<&Value> {
        self.results.get(&task_id.to_string())
    }

    /// Increment the version for the next write.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}
