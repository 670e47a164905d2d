//! Hook runner: executable checks with timeouts, budgets and history.

mod classify;
mod history;
mod runner;

pub use classify::{classify, ErrorClass, FailureCategory};
pub use history::{
    health_report, HealthStatus, HookHealth, HookHistory, HookResult, HookStatus, RunRecord,
    RunSummary, TimeoutSource,
};
pub use runner::{affinity_of, discover, HookCheck, HookInvocation, HookRun, HookRunner};

/// Circuit resource id for a check.
pub fn circuit_resource(name: &str) -> String {
    format!("hook:{}", name)
}
