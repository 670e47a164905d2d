//! Failure classification for non-zero hook exits.
//!
//! Exit codes are checked first (timeout, not found, permission denied),
//! then an ordered list of output patterns. The category is advisory
//! metadata for operators and the health report; nothing retries on it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::process::{EXIT_NOT_FOUND, EXIT_PERMISSION_DENIED, EXIT_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    CommandNotFound,
    PermissionDenied,
    ModuleNotFound,
    SyntaxError,
    MissingFile,
    Crash,
    NetworkError,
    ConfigError,
    Unknown,
}

/// How an operator should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Recovers on its own; handled by circuit re-admission.
    TransientExternal,
    /// Needs a config or environment fix.
    Configuration,
    /// The check itself is broken.
    Structural,
    Unknown,
}

impl FailureCategory {
    pub fn class(self) -> ErrorClass {
        match self {
            FailureCategory::Timeout | FailureCategory::NetworkError => ErrorClass::TransientExternal,
            FailureCategory::CommandNotFound
            | FailureCategory::PermissionDenied
            | FailureCategory::MissingFile
            | FailureCategory::ConfigError => ErrorClass::Configuration,
            FailureCategory::ModuleNotFound | FailureCategory::SyntaxError | FailureCategory::Crash => {
                ErrorClass::Structural
            }
            FailureCategory::Unknown => ErrorClass::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::CommandNotFound => "command_not_found",
            FailureCategory::PermissionDenied => "permission_denied",
            FailureCategory::ModuleNotFound => "module_not_found",
            FailureCategory::SyntaxError => "syntax_error",
            FailureCategory::MissingFile => "missing_file",
            FailureCategory::Crash => "crash",
            FailureCategory::NetworkError => "network_error",
            FailureCategory::ConfigError => "config_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output patterns, evaluated in order after the exit-code checks.
static TEXT_RULES: LazyLock<Vec<(FailureCategory, Regex)>> = LazyLock::new(|| {
    vec![
        (
            FailureCategory::ModuleNotFound,
            Regex::new(r"(?i)(cannot find module|modulenotfounderror|no module named|module not found|unresolved import|cannot find package)").unwrap(),
        ),
        (
            FailureCategory::SyntaxError,
            Regex::new(r"(?i)(syntaxerror|syntax error|unexpected token|unexpected end of|parse error)").unwrap(),
        ),
        (
            FailureCategory::MissingFile,
            Regex::new(r"(?i)(no such file or directory|enoent|file not found)").unwrap(),
        ),
        (
            FailureCategory::Crash,
            Regex::new(r"(?i)(traceback \(most recent call last\)|panicked at|segmentation fault|core dumped|uncaught exception|unhandled( promise)? rejection|typeerror|referenceerror|fatal error)").unwrap(),
        ),
        (
            FailureCategory::NetworkError,
            Regex::new(r"(?i)(econnrefused|econnreset|etimedout|enotfound|connection (refused|reset|timed out)|network is unreachable|could not resolve host|getaddrinfo|socket hang up|\bhttp 5\d\d\b)").unwrap(),
        ),
        (
            FailureCategory::ConfigError,
            Regex::new(r"(?i)(invalid config|configuration error|not configured|missing (env|environment variable|api key|token|credentials)|\b(401|403)\b|unauthorized)").unwrap(),
        ),
    ]
});

pub fn classify(exit_code: i32, output: &str) -> FailureCategory {
    match exit_code {
        EXIT_TIMEOUT => return FailureCategory::Timeout,
        EXIT_NOT_FOUND => return FailureCategory::CommandNotFound,
        EXIT_PERMISSION_DENIED => return FailureCategory::PermissionDenied,
        _ => {}
    }
    TEXT_RULES
        .iter()
        .find(|(_, re)| re.is_match(output))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown)
}
