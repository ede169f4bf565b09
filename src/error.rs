use thiserror::Error;

use crate::core::task::{TaskId, TaskType};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Blocking task failed: {0}")]
    TaskJoin(String),

    // State manager
    #[error("State lock error: {0}")]
    StateLock(String),

    #[error("State load error: {0}")]
    StateLoad(String),

    #[error("State save error: {0}")]
    StateSave(String),

    #[error("State not found for task {0}")]
    StateNotFound(TaskId),

    // Context manager
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Context version conflict (current: {current}, provided: {provided})")]
    ContextVersion { current: u64, provided: u64 },

    // Task pool and tasks
    #[error("Task pool error: {0}")]
    TaskPool(String),

    #[error("Task creation error: {0}")]
    TaskCreation(String),

    #[error("Task type not registered: {0}")]
    TaskTypeNotFound(TaskType),

    #[error("Invalid task configuration: {0}")]
    TaskConfigValidation(String),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Task {task_id} exceeded max retries ({retries})")]
    TaskMaxRetries { task_id: TaskId, retries: u32 },

    #[error("Scheduler error in {context}: {source}")]
    Scheduler {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error raised inside a scheduler operation.
    pub fn scheduler(context: impl Into<String>, source: Error) -> Self {
        Self::Scheduler {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `Scheduler` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Scheduler { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
