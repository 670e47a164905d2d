//! Task data model for the work queue.
//!
//! Tasks are the units of work the control plane hands to its consumer.
//! Each task tracks status, priority, complexity, dependencies and the
//! provenance of the signal that created it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Queue-wide task identifier, rendered as `wq-NNN`.
///
/// Ids are allocated from a monotonically increasing counter that also
/// covers archived tasks, so an id is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wq-{:03}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("wq-").unwrap_or(s.trim());
        digits
            .parse::<u32>()
            .map(TaskId)
            .map_err(|_| format!("invalid task id: {}", s))
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting to be selected.
    #[default]
    Pending,
    /// Waiting on an external condition, optionally checked by `blocker_check`.
    Blocked,
    /// Claimed by the consumer.
    InProgress,
    Done,
    /// Closed without completion (superseded, duplicate, abandoned).
    Retired,
}

impl TaskStatus {
    /// Done and retired tasks are eligible for archival.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Retired)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Rough size estimate used by the selector when the budget is tight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Complexity {
    S,
    #[default]
    M,
    L,
}

impl std::str::FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" => Ok(Complexity::S),
            "M" => Ok(Complexity::M),
            "L" => Ok(Complexity::L),
            other => Err(format!("invalid complexity: {} (expected S, M or L)", other)),
        }
    }
}

/// A progress note attached by a session or pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressNote {
    /// Session or step marker, e.g. `s1204` or `pass`.
    pub marker: String,
    pub text: String,
}

/// A single unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Lower runs earlier.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, rename = "deps")]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub notes: Vec<ProgressNote>,
    /// Shell predicate; exit code 0 means the blocker has cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_check: Option<String>,
    /// Provenance tag (`backlog`, `followup`, `friction`, `observation`, `manual`).
    #[serde(default)]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, title: &str) -> Self {
        Self {
            id,
            title: title.trim().to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            complexity: Complexity::default(),
            tags: BTreeSet::new(),
            dependencies: Vec::new(),
            notes: Vec::new(),
            blocker_check: None,
            source: "manual".to_string(),
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_note(&mut self, marker: &str, text: &str) {
        self.notes.push(ProgressNote {
            marker: marker.to_string(),
            text: text.to_string(),
        });
    }

    pub fn close(&mut self, status: TaskStatus, at: DateTime<Utc>) {
        self.status = status;
        self.closed_at = Some(at);
    }
}

/// Fields a caller supplies when creating a task; the queue assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub complexity: Complexity,
    pub tags: BTreeSet<String>,
    pub dependencies: Vec<TaskId>,
    pub blocker_check: Option<String>,
    pub source: String,
}

impl NewTask {
    pub fn titled(title: &str, source: &str) -> Self {
        Self {
            title: title.trim().to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.trim().to_string();
        self
    }
}
