//! Dependency resolution over the live queue.
//!
//! A dependency is satisfied when the task it names is done, or when it no
//! longer appears in the live queue at all: archival implies completion, so
//! an id that only survives in the archive (or nowhere) never blocks.
//!
//! `DependencyGraph` builds a petgraph view of the live queue for checks
//! that need the whole structure (cycle detection, dependents, ordering).

use crate::core::queue::TaskQueue;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// True when every dependency of `task` is done or absent from the live queue.
pub fn deps_satisfied(task: &Task, queue: &TaskQueue) -> bool {
    task.dependencies.iter().all(|dep| match queue.get(*dep) {
        Some(dep_task) => dep_task.status == TaskStatus::Done,
        None => true,
    })
}

/// True when `task` is pending and all of its dependencies are satisfied.
pub fn is_selectable(task: &Task, queue: &TaskQueue) -> bool {
    task.status == TaskStatus::Pending && deps_satisfied(task, queue)
}

/// Dependencies of `task` that still hold it back.
pub fn unsatisfied_deps(task: &Task, queue: &TaskQueue) -> Vec<TaskId> {
    task.dependencies
        .iter()
        .copied()
        .filter(|dep| {
            queue
                .get(*dep)
                .map(|t| t.status != TaskStatus::Done)
                .unwrap_or(false)
        })
        .collect()
}

/// Graph of live tasks; an edge `a -> b` means `b` depends on `a`.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from the live queue. Edges to archived or unknown
    /// ids are dropped since those dependencies are satisfied.
    pub fn build(queue: &TaskQueue) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for task in &queue.queue {
            let node = graph.add_node(task.id);
            index.insert(task.id, node);
        }
        for task in &queue.queue {
            let to = index[&task.id];
            for dep in &task.dependencies {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph, index }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Fail with the first task found on a cycle.
    pub fn validate(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }

    /// Task ids ordered so each comes after its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::DependencyCycle(id)
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n).copied())
            .collect())
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        match self.index.get(&id) {
            Some(&node) => {
                let mut out: Vec<TaskId> = self
                    .graph
                    .neighbors_directed(node, petgraph::Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n).copied())
                    .collect();
                out.sort();
                out
            }
            None => Vec::new(),
        }
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
