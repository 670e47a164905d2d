//! Core domain models for the control plane.
//!
//! Tasks, the persistent queue that holds them, and dependency resolution
//! over the live queue.

pub mod dag;
pub mod queue;
pub mod task;

pub use dag::{deps_satisfied, is_selectable, unsatisfied_deps, DependencyGraph};
pub use queue::TaskQueue;
pub use task::{Complexity, NewTask, ProgressNote, Task, TaskId, TaskStatus};
