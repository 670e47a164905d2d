//! Picks the next unit of work.
//!
//! Selection is a pure read over the queue:
//! 1. keep selectable tasks (pending, dependencies satisfied);
//! 2. order by priority, then stably move urgent-tagged tasks to the front;
//! 3. under a tight budget prefer the first task that is not large;
//! 4. with nothing selectable, offer the oldest backlog idea that is not
//!    already queued as a provisional fallback.

use serde::Serialize;

use crate::config::QueueConfig;
use crate::core::{is_selectable, Complexity, Task, TaskId, TaskQueue};
use crate::dedup::DedupEngine;
use crate::replenish::BacklogIdea;

/// What the consumer should work on next.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assignment {
    /// A committed task from the queue.
    Task { id: TaskId, title: String },
    /// A backlog idea the consumer should formalize into a task.
    Fallback { idea: BacklogIdea },
    /// Nothing to do.
    Idle,
}

impl Assignment {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Assignment::Task { id, .. } => Some(*id),
            _ => None,
        }
    }
}

pub struct Selector<'a> {
    config: &'a QueueConfig,
    dedup: &'a DedupEngine,
}

impl<'a> Selector<'a> {
    pub fn new(config: &'a QueueConfig, dedup: &'a DedupEngine) -> Self {
        Self { config, dedup }
    }

    /// Selectable tasks in boosted order.
    pub fn candidates<'q>(&self, queue: &'q TaskQueue) -> Vec<&'q Task> {
        let mut eligible: Vec<&Task> = queue
            .queue
            .iter()
            .filter(|t| is_selectable(t, queue))
            .collect();
        eligible.sort_by_key(|t| t.priority);
        let (mut boosted, rest): (Vec<&Task>, Vec<&Task>) = eligible
            .into_iter()
            .partition(|t| t.has_tag(&self.config.urgent_tag));
        boosted.extend(rest);
        boosted
    }

    /// Choose the next task, or a backlog fallback when none is selectable.
    pub fn select_next(
        &self,
        queue: &TaskQueue,
        budget_cap: Option<f64>,
        backlog: &[BacklogIdea],
    ) -> Assignment {
        let candidates = self.candidates(queue);
        let tight = budget_cap
            .map(|cap| cap < self.config.budget_threshold)
            .unwrap_or(false);

        let chosen = if tight {
            candidates
                .iter()
                .find(|t| t.complexity != Complexity::L)
                .or_else(|| candidates.first())
        } else {
            candidates.first()
        };

        if let Some(task) = chosen {
            return Assignment::Task {
                id: task.id,
                title: task.title.clone(),
            };
        }

        let titles = queue.known_titles();
        backlog
            .iter()
            .find(|idea| {
                !self
                    .dedup
                    .is_duplicate(&idea.title, titles.iter().map(String::as_str))
            })
            .map(|idea| Assignment::Fallback { idea: idea.clone() })
            .unwrap_or(Assignment::Idle)
    }
}
