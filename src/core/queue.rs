//! The persistent work queue: live tasks plus the archive of closed ones.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{NewTask, Task, TaskId, TaskStatus};
use crate::{klog_debug, Error, Result};

/// Live queue and archive, stored together as one record set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQueue {
    #[serde(default)]
    pub next_id: u32,
    #[serde(default)]
    pub queue: Vec<Task>,
    #[serde(default)]
    pub archive: Vec<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.queue.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.queue.iter_mut().find(|t| t.id == id)
    }

    pub fn is_archived(&self, id: TaskId) -> bool {
        self.archive.iter().any(|t| t.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.queue.iter().filter(|t| t.status == status).count()
    }

    pub fn pending_count(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    pub fn titles(&self) -> Vec<String> {
        self.queue.iter().map(|t| t.title.clone()).collect()
    }

    /// Titles of live and archived tasks.
    pub fn known_titles(&self) -> Vec<String> {
        self.queue
            .iter()
            .chain(self.archive.iter())
            .map(|t| t.title.clone())
            .collect()
    }

    /// Allocate the next id, accounting for every id ever stored.
    fn allocate_id(&mut self) -> TaskId {
        let highest = self
            .queue
            .iter()
            .chain(self.archive.iter())
            .map(|t| t.id.0)
            .max()
            .unwrap_or(0);
        let id = self.next_id.max(highest + 1).max(1);
        self.next_id = id + 1;
        TaskId(id)
    }

    /// Add a task, validating its dependencies.
    ///
    /// Dependencies must name a live or archived task. Since the new id
    /// is fresh, an added task can never close a cycle.
    pub fn add(&mut self, new: NewTask, now: DateTime<Utc>) -> Result<TaskId> {
        if new.title.trim().is_empty() {
            return Err(Error::Validation("task title must not be empty".to_string()));
        }
        for dep in &new.dependencies {
            if self.get(*dep).is_none() && !self.is_archived(*dep) {
                return Err(Error::TaskNotFound(*dep));
            }
        }

        let id = self.allocate_id();
        let mut task = Task::new(id, &new.title);
        task.description = new.description;
        task.priority = new.priority;
        task.complexity = new.complexity;
        task.tags = new.tags;
        task.dependencies = new.dependencies;
        task.source = if new.source.is_empty() {
            "manual".to_string()
        } else {
            new.source
        };
        task.created_at = now;
        if let Some(check) = new.blocker_check {
            task.status = TaskStatus::Blocked;
            task.blocker_check = Some(check);
        }
        klog_debug!("TaskQueue::add id={} source={}", id, task.source);
        self.queue.push(task);
        Ok(id)
    }

    fn require_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.get_mut(id).ok_or(Error::TaskNotFound(id))
    }

    /// Mark a pending task as claimed by the consumer.
    pub fn claim(&mut self, id: TaskId) -> Result<()> {
        let task = self.require_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Err(Error::Validation(format!(
                "cannot claim {}: status is {}",
                id, task.status
            )));
        }
        task.status = TaskStatus::InProgress;
        Ok(())
    }

    pub fn complete(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        self.require_mut(id)?.close(TaskStatus::Done, now);
        Ok(())
    }

    pub fn retire(&mut self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let task = self.require_mut(id)?;
        task.add_note("retire", reason);
        task.close(TaskStatus::Retired, now);
        Ok(())
    }

    /// Block a task until `check` exits zero.
    pub fn block(&mut self, id: TaskId, check: &str) -> Result<()> {
        let task = self.require_mut(id)?;
        task.status = TaskStatus::Blocked;
        task.blocker_check = Some(check.to_string());
        Ok(())
    }

    pub fn add_note(&mut self, id: TaskId, marker: &str, text: &str) -> Result<()> {
        self.require_mut(id)?.add_note(marker, text);
        Ok(())
    }

    /// Move a task from the live queue into the archive.
    pub fn archive_task(&mut self, id: TaskId) -> Option<TaskId> {
        let pos = self.queue.iter().position(|t| t.id == id)?;
        let task = self.queue.remove(pos);
        self.archive.push(task);
        Some(id)
    }

    /// Archive closed tasks whose close time is older than `retention`.
    pub fn archive_closed(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<TaskId> {
        let expired: Vec<TaskId> = self
            .queue
            .iter()
            .filter(|t| t.status.is_closed())
            .filter(|t| t.closed_at.map(|at| now - at >= retention).unwrap_or(true))
            .map(|t| t.id)
            .collect();
        for id in &expired {
            self.archive_task(*id);
        }
        expired
    }
}
