//! Runs a directory of executable checks.
//!
//! Sequential by default; with `parallel` set, checks run in fixed-size
//! batches and each batch is awaited in full before the next starts. The
//! aggregate budget is checked before each launch (or batch). A separate
//! hard deadline cancels anything still running so the runner itself
//! cannot hang.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::classify::classify;
use super::history::{HookHistory, HookResult, HookStatus, RunRecord, RunSummary, TimeoutSource};
use crate::config::HooksConfig;
use crate::process::{self, ProcessSpec};
use crate::util::tail_excerpt;
use crate::{klog, klog_debug, Error, Result};

/// One runner invocation.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub dir: PathBuf,
    pub default_timeout: Duration,
    pub run_id: Option<String>,
    pub budget: Option<Duration>,
    pub parallel: Option<usize>,
    pub category: Option<String>,
}

impl HookInvocation {
    pub fn new(dir: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            default_timeout,
            run_id: None,
            budget: None,
            parallel: None,
            category: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCheck {
    pub name: String,
    pub path: PathBuf,
    pub affinity: Option<String>,
}

/// `20-engage_E` -> `Some("E")`: a trailing `_` plus 1-3 uppercase letters.
pub fn affinity_of(stem: &str) -> Option<&str> {
    let (_, tag) = stem.rsplit_once('_')?;
    let valid = (1..=3).contains(&tag.len()) && tag.chars().all(|c| c.is_ascii_uppercase());
    valid.then_some(tag)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    true
}

/// Eligible checks in lexical order. A missing directory has no checks.
pub fn discover(dir: &Path, category: Option<&str>) -> Result<Vec<HookCheck>> {
    if !dir.exists() {
        klog_debug!("Hooks dir {} missing, nothing to run", dir.display());
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::HooksDirUnreadable(format!("{}: {}", dir.display(), e)))?;

    let mut checks = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let Ok(meta) = fs::metadata(entry.path()) else {
            continue;
        };
        if !meta.is_file() || !is_executable(&meta) {
            continue;
        }
        let path = entry.path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let affinity = affinity_of(&stem).map(str::to_string);
        let eligible = match (&affinity, category) {
            (None, _) => true,
            (Some(tag), Some(cat)) => tag == cat,
            (Some(_), None) => false,
        };
        if eligible {
            checks.push(HookCheck { name, path, affinity });
        }
    }
    checks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(checks)
}

/// Human-readable runner output, one entry per event.
fn log_line(message: &str) -> String {
    format!("{} {}", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true), message)
}

/// A finished run: the structured record plus its log lines.
#[derive(Debug, Clone)]
pub struct HookRun {
    pub record: RunRecord,
    pub log: Vec<String>,
}

pub struct HookRunner<'a> {
    config: &'a HooksConfig,
    history: &'a HookHistory,
}

impl<'a> HookRunner<'a> {
    pub fn new(config: &'a HooksConfig, history: &'a HookHistory) -> Self {
        Self { config, history }
    }

    /// Effective timeout: learned profile, then penalty, then default.
    pub fn resolve_timeout(&self, name: &str, default: Duration) -> (Duration, TimeoutSource) {
        if let Some(secs) = self.history.profile_timeout_secs(name, self.config) {
            return (Duration::from_secs(secs), TimeoutSource::Profile);
        }
        if self.history.timed_out_last_run(name) {
            let halved = (default.as_secs() / 2).max(self.config.penalty_floor_secs);
            return (Duration::from_secs(halved), TimeoutSource::Penalty);
        }
        (default, TimeoutSource::Default)
    }

    async fn run_check(
        &self,
        check: &HookCheck,
        inv: &HookInvocation,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> HookResult {
        let (timeout, source) = self.resolve_timeout(&check.name, inv.default_timeout);
        let mut spec = ProcessSpec::new(&check.path, timeout).env("KEEL_RUN_ID", run_id);
        if let Some(category) = &inv.category {
            spec = spec.env("KEEL_HOOK_CATEGORY", category.as_str());
        }
        let out = process::run(&spec, cancel).await;
        let (status, excerpt, category) = if out.success() {
            (HookStatus::Ok, String::new(), None)
        } else {
            let combined = out.combined();
            (
                HookStatus::Fail(out.exit_code),
                tail_excerpt(&combined, self.config.excerpt_chars),
                Some(classify(out.exit_code, &combined)),
            )
        };
        HookResult {
            name: check.name.clone(),
            status,
            duration_ms: out.duration_ms,
            error_excerpt: excerpt,
            failure_category: category,
            timeout_secs: timeout.as_secs(),
            timeout_source: Some(source),
        }
    }

    pub async fn run(&self, inv: &HookInvocation) -> Result<HookRun> {
        let checks = discover(&inv.dir, inv.category.as_deref())?;
        let run_id = inv
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started_at = Utc::now();
        let started = Instant::now();

        let cancel = CancellationToken::new();
        let deadline = Duration::from_secs(self.config.hard_deadline_secs);
        let watchdog = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                klog!("Hook runner hit hard deadline after {}s", deadline.as_secs());
                cancel.cancel();
            })
        };

        let over_budget = |started: &Instant| {
            cancel.is_cancelled()
                || inv
                    .budget
                    .map(|budget| started.elapsed() > budget)
                    .unwrap_or(false)
        };

        let batch_size = inv.parallel.unwrap_or(1).max(1);
        let mut results: Vec<HookResult> = Vec::with_capacity(checks.len());
        let mut log = Vec::new();

        for batch in checks.chunks(batch_size) {
            if over_budget(&started) {
                for check in batch {
                    log.push(log_line(&format!("hook SKIPPED (budget): {}", check.name)));
                    results.push(HookResult::skipped(&check.name));
                }
                continue;
            }
            for check in batch {
                log.push(log_line(&format!("running hook: {}", check.name)));
            }
            let outcomes =
                join_all(batch.iter().map(|check| self.run_check(check, inv, &run_id, &cancel))).await;
            for result in outcomes {
                if let HookStatus::Fail(code) = result.status {
                    let category = result.failure_category.map(|c| c.as_str()).unwrap_or("unknown");
                    log.push(log_line(&format!(
                        "hook FAILED: {} (exit {}, {}, {}ms)",
                        result.name, code, category, result.duration_ms
                    )));
                }
                results.push(result);
            }
        }
        watchdog.abort();

        let total_ms = started.elapsed().as_millis() as u64;
        let summary = RunSummary::of(&results, total_ms);
        klog!(
            "Hook run {}: {} ok, {} failed, {} skipped in {}ms",
            run_id,
            summary.ok,
            summary.fail,
            summary.skip,
            total_ms
        );
        Ok(HookRun {
            record: RunRecord {
                run_id,
                started_at,
                category: inv.category.clone(),
                budget_secs: inv.budget.map(|b| b.as_secs()),
                results,
                summary,
            },
            log,
        })
    }
}
