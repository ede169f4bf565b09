//! Task factory: turns a `TaskConfig` into a runnable `Task`.
//!
//! `TaskRegistry` maps each `TaskType` to a constructor. A constructor
//! receives the config's `payload` deserialized into its own parameter type
//! and returns the body that will run.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::task::{Task, TaskBody, TaskConfig, TaskType};
use crate::error::{Error, Result};

/// Creates tasks from descriptors.
pub trait TaskFactory: Send + Sync {
    /// # Errors
    /// `TaskTypeNotFound` if nothing handles the type, `TaskConfigValidation`
    /// if the config or payload is invalid, `TaskCreation` if the
    /// constructor fails.
    fn create_task(&self, config: TaskConfig) -> Result<Task>;
}

type Constructor = Arc<dyn Fn(&TaskConfig) -> Result<Arc<dyn TaskBody>> + Send + Sync>;

/// Registry of constructors keyed by task type.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: HashMap<TaskType, Constructor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor taking the payload as `P`.
    ///
    /// Replaces any constructor already registered for `task_type`.
    pub fn register<P, B, F>(&mut self, task_type: TaskType, constructor: F) -> &mut Self
    where
        P: DeserializeOwned,
        B: TaskBody + 'static,
        F: Fn(P) -> Result<B> + Send + Sync + 'static,
    {
        let build = move |config: &TaskConfig| -> Result<Arc<dyn TaskBody>> {
            let params: P = serde_json::from_value(config.payload.clone()).map_err(|e| {
                Error::TaskConfigValidation(format!(
                    "invalid payload for {} task {}: {}",
                    config.task_type, config.id, e
                ))
            })?;
            let body = constructor(params).map_err(|e| match e {
                Error::TaskConfigValidation(_) => e,
                other => Error::TaskCreation(format!(
                    "{} task {}: {}",
                    config.task_type, config.id, other
                )),
            })?;
            Ok(Arc::new(body))
        };
        self.constructors.insert(task_type, Arc::new(build));
        self
    }

    /// Register one shared body for every task of `task_type`.
    pub fn register_body(&mut self, task_type: TaskType, body: Arc<dyn TaskBody>) -> &mut Self {
        self.constructors
            .insert(task_type, Arc::new(move |_: &TaskConfig| Ok(Arc::clone(&body))));
        self
    }

    pub fn is_registered(&self, task_type: TaskType) -> bool {
        self.constructors.contains_key(&task_type)
    }
}

impl TaskFactory for TaskRegistry {
    fn create_task(&self, config: TaskConfig) -> Result<Task> {
        let constructor = self
            .constructors
            .get(&config.task_type)
            .ok_or(Error::TaskTypeNotFound(config.task_type))?;
        let body = constructor(&config)?;
        let task = Task::new(config, body)?;
        debug!(task_id = %task.config().id.short(), task_type = %task.config().task_type, "task created");
        Ok(task)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
