//! Pipelines: named groups of tasks sharing one execution context.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::Task;
use crate::error::{Error, Result};

/// Unique identifier for a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub Uuid);

impl PipelineId {
    /// Create a new unique pipeline identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A group of tasks scheduled together.
///
/// All tasks of a pipeline read and write the same context, and at most
/// `max_parallel` of them run at once.
#[derive(Debug)]
pub struct Pipeline {
    pub id: PipelineId,
    pub tasks: Vec<Task>,
    pub max_parallel: usize,
}

impl Pipeline {
    /// Create a pipeline.
    ///
    /// # Errors
    /// Returns `Validation` if `tasks` is empty or `max_parallel` is zero.
    pub fn new(tasks: Vec<Task>, max_parallel: usize) -> Result<Self> {
        if tasks.is_empty() {
            return Err(Error::Validation(
                "pipeline must contain at least one task".to_string(),
            ));
        }
        if max_parallel == 0 {
            return Err(Error::Validation(
                "pipeline max_parallel must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            id: PipelineId::new(),
            tasks,
            max_parallel,
        })
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
