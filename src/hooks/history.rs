//! Tracked hook runs: the results file, adaptive timeouts, health report.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classify::FailureCategory;
use crate::config::HooksConfig;
use crate::process::EXIT_TIMEOUT;
use crate::store::StateStore;
use crate::util::percentile;
use crate::{klog_warn, Result};

/// Outcome of one check. Serialized as `ok`, `fail:<code>` or `budget_skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum HookStatus {
    Ok,
    Fail(i32),
    BudgetSkip,
}

impl HookStatus {
    pub fn is_fail(&self) -> bool {
        matches!(self, HookStatus::Fail(_))
    }

    pub fn timed_out(&self) -> bool {
        *self == HookStatus::Fail(EXIT_TIMEOUT)
    }
}

impl std::fmt::Display for HookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookStatus::Ok => write!(f, "ok"),
            HookStatus::Fail(code) => write!(f, "fail:{}", code),
            HookStatus::BudgetSkip => write!(f, "budget_skip"),
        }
    }
}

impl From<HookStatus> for String {
    fn from(status: HookStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for HookStatus {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "ok" => Ok(HookStatus::Ok),
            "budget_skip" => Ok(HookStatus::BudgetSkip),
            other => other
                .strip_prefix("fail:")
                .and_then(|code| code.parse().ok())
                .map(HookStatus::Fail)
                .ok_or_else(|| format!("invalid hook status: {}", other)),
        }
    }
}

/// Where a check's effective timeout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutSource {
    Profile,
    Penalty,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub name: String,
    pub status: HookStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_source: Option<TimeoutSource>,
}

impl HookResult {
    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HookStatus::BudgetSkip,
            duration_ms: 0,
            error_excerpt: String::new(),
            failure_category: None,
            timeout_secs: 0,
            timeout_source: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ok: usize,
    pub fail: usize,
    pub skip: usize,
    pub total_ms: u64,
}

impl RunSummary {
    pub fn of(results: &[HookResult], total_ms: u64) -> Self {
        let count = |pred: fn(&HookStatus) -> bool| results.iter().filter(|r| pred(&r.status)).count();
        Self {
            ok: count(|s| *s == HookStatus::Ok),
            fail: count(HookStatus::is_fail),
            skip: count(|s| *s == HookStatus::BudgetSkip),
            total_ms,
        }
    }
}

/// One invocation of the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_secs: Option<u64>,
    pub results: Vec<HookResult>,
    pub summary: RunSummary,
}

/// Past runs, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HookHistory {
    records: Vec<RunRecord>,
}

impl HookHistory {
    pub fn new(records: Vec<RunRecord>) -> Self {
        Self { records }
    }

    /// Read a results file; a missing file is an empty history.
    pub fn try_load(store: &mut StateStore, path: &Path) -> Result<Self> {
        store.load_json_at::<Vec<RunRecord>>(path).map(Self::new)
    }

    /// Like [`HookHistory::try_load`], but an unreadable file counts as no history.
    pub fn load(store: &mut StateStore, path: &Path) -> Self {
        match Self::try_load(store, path) {
            Ok(history) => history,
            Err(e) => {
                klog_warn!("Ignoring unreadable hook history {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Append a run and keep the most recent `window` runs.
    pub fn push(&mut self, record: RunRecord, window: usize) {
        self.records.push(record);
        if self.records.len() > window {
            let excess = self.records.len() - window;
            self.records.drain(..excess);
        }
    }

    pub fn save(&self, store: &mut StateStore, path: &Path) -> Result<()> {
        store.write_json_at(path, &self.records)
    }

    /// Results for one check, newest first.
    fn results_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (&'a RunRecord, &'a HookResult)> + 'a {
        self.records
            .iter()
            .rev()
            .filter_map(move |run| run.results.iter().find(|r| r.name == name).map(|r| (run, r)))
    }

    /// True when the most recent run that included `name` timed it out.
    pub fn timed_out_last_run(&self, name: &str) -> bool {
        self.results_for(name)
            .find(|(_, r)| r.status != HookStatus::BudgetSkip)
            .map(|(_, r)| r.status.timed_out())
            .unwrap_or(false)
    }

    /// Learned timeout: P95 of successful durations with headroom, in
    /// whole seconds. `None` until enough samples exist.
    pub fn profile_timeout_secs(&self, name: &str, config: &HooksConfig) -> Option<u64> {
        let samples: Vec<u64> = self
            .results_for(name)
            .filter(|(_, r)| r.status == HookStatus::Ok)
            .map(|(_, r)| r.duration_ms)
            .collect();
        if samples.len() < config.profile_min_samples.max(1) {
            return None;
        }
        let p95 = percentile(&samples, 95.0)?;
        let secs = ((p95 as f64 * config.profile_headroom) / 1000.0).ceil() as u64;
        Some(secs.max(config.penalty_floor_secs))
    }

    /// Failure counts per check over the last `runs` runs.
    pub fn recent_failure_counts(&self, runs: usize) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for run in self.records.iter().rev().take(runs) {
            for result in run.results.iter().filter(|r| r.status.is_fail()) {
                *counts.entry(result.name.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.records.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Failing,
    Warn,
    Ok,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Failing => "FAILING",
            HealthStatus::Warn => "WARN",
            HealthStatus::Ok => "OK",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookHealth {
    pub name: String,
    pub runs: usize,
    pub fails: usize,
    pub fail_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_category: Option<FailureCategory>,
    pub status: HealthStatus,
}

const HEALTH_WINDOW: usize = 20;
const FAILING_AT: usize = 5;

/// Per-check health over each check's last 20 executed results, worst first.
pub fn health_report(history: &HookHistory) -> Vec<HookHealth> {
    let mut names: Vec<&str> = history
        .records()
        .iter()
        .flat_map(|run| run.results.iter().map(|r| r.name.as_str()))
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut report: Vec<HookHealth> = names
        .into_iter()
        .map(|name| {
            let recent: Vec<(&RunRecord, &HookResult)> = history
                .results_for(name)
                .filter(|(_, r)| r.status != HookStatus::BudgetSkip)
                .take(HEALTH_WINDOW)
                .collect();
            let failures: Vec<&(&RunRecord, &HookResult)> =
                recent.iter().filter(|(_, r)| r.status.is_fail()).collect();
            let fails = failures.len();
            let status = match fails {
                0 => HealthStatus::Ok,
                n if n < FAILING_AT => HealthStatus::Warn,
                _ => HealthStatus::Failing,
            };
            HookHealth {
                name: name.to_string(),
                runs: recent.len(),
                fails,
                fail_rate: if recent.is_empty() { 0.0 } else { fails as f64 / recent.len() as f64 },
                last_failure: failures.first().map(|(run, _)| run.started_at),
                last_category: failures.first().and_then(|(_, r)| r.failure_category),
                status,
            }
        })
        .collect();
    report.sort_by(|a, b| a.status.cmp(&b.status).then_with(|| a.name.cmp(&b.name)));
    report
}
