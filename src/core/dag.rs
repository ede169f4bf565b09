//! Dependency graph for task gating.
//!
//! `DependencyGraph` keeps one node per task id (including ids that are only
//! referenced as dependencies) in a petgraph `StableDiGraph`, so node indices
//! stay valid when finished tasks are released. Edges point from a
//! dependency to its dependent. Alongside the graph it tracks, for every
//! registered task, the set of dependencies that have not resolved yet.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Task dependency graph with per-task unresolved sets.
pub struct DependencyGraph {
    /// The underlying directed graph.
    graph: StableDiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Registered tasks and the dependencies they still wait on.
    unresolved: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            unresolved: HashMap::new(),
        }
    }

    fn node(&mut self, id: TaskId) -> (NodeIndex, bool) {
        if let Some(&index) = self.task_index.get(&id) {
            return (index, false);
        }
        let index = self.graph.add_node(id);
        self.task_index.insert(id, index);
        (index, true)
    }

    fn drop_node(&mut self, index: NodeIndex) {
        if let Some(id) = self.graph.remove_node(index) {
            self.task_index.remove(&id);
        }
    }

    /// Register a task and its dependencies.
    ///
    /// Dependencies for which `is_resolved` returns true are recorded as
    /// edges but do not block the task.
    ///
    /// # Errors
    /// Returns `TaskPool` if the task is already registered or if the new
    /// edges would close a cycle. The graph is left unchanged on error.
    pub fn add_task<F>(&mut self, id: TaskId, dependencies: &[TaskId], is_resolved: F) -> Result<()>
    where
        F: Fn(&TaskId) -> bool,
    {
        if self.unresolved.contains_key(&id) {
            return Err(Error::TaskPool(format!(
                "Task {} already registered in dependency graph",
                id
            )));
        }

        let (node, created) = self.node(id);
        let mut new_nodes = Vec::new();
        let mut new_edges = Vec::new();
        for dep in dependencies {
            let (dep_node, dep_created) = self.node(*dep);
            if dep_created {
                new_nodes.push(dep_node);
            }
            if self.graph.find_edge(dep_node, node).is_none() {
                new_edges.push(self.graph.add_edge(dep_node, node, ()));
            }
        }

        if is_cyclic_directed(&self.graph) {
            for edge in new_edges {
                self.graph.remove_edge(edge);
            }
            for dep_node in new_nodes {
                self.drop_node(dep_node);
            }
            if created {
                self.drop_node(node);
            }
            return Err(Error::TaskPool(format!(
                "Adding task {} would create a dependency cycle",
                id
            )));
        }

        let waiting = dependencies
            .iter()
            .filter(|dep| !is_resolved(dep))
            .copied()
            .collect();
        self.unresolved.insert(id, waiting);
        Ok(())
    }

    /// Mark `dependency` as resolved for every dependent.
    ///
    /// Returns the dependents that have no unresolved dependencies left.
    pub fn resolve(&mut self, dependency: &TaskId) -> Vec<TaskId> {
        let mut ready = Vec::new();
        for dependent in self.dependents(dependency) {
            if let Some(waiting) = self.unresolved.get_mut(&dependent) {
                if waiting.remove(dependency) && waiting.is_empty() {
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// Forget a task: its unresolved set and its node.
    ///
    /// Dependents keep their own unresolved sets; resolve first if the task
    /// completed.
    pub fn release(&mut self, id: &TaskId) {
        self.unresolved.remove(id);
        if let Some(&index) = self.task_index.get(id) {
            self.drop_node(index);
        }
    }

    /// Whether every dependency of a registered task has resolved.
    ///
    /// Unregistered ids are reported as not ready.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        self.unresolved
            .get(id)
            .map(|waiting| waiting.is_empty())
            .unwrap_or(false)
    }

    /// Dependencies the task still waits on.
    #[cfg(test)]
    fn unresolved_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.unresolved
            .get(id)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks that declared `id` as a dependency (successors).
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks that `id` declared as dependencies (predecessors).
    #[cfg(test)]
    fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n).copied())
                .collect(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    fn contains_task(&self, id: &TaskId) -> bool {
        self.unresolved.contains_key(id)
    }

    /// Number of registered tasks.
    fn task_count(&self) -> usize {
        self.unresolved.len()
    }

    /// Number of dependency edges.
    fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
