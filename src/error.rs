use thiserror::Error;

use crate::core::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Dependency cycle detected at task: {0}")]
    DependencyCycle(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Hooks directory unreadable: {0}")]
    HooksDirUnreadable(String),

    #[error("Subprocess error: {0}")]
    Subprocess(String),
}

pub type Result<T> = std::result::Result<T, Error>;
