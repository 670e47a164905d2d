//! One orchestration pass.
//!
//! Reads state once, runs each section in order, and writes everything back
//! once at the end. A section that fails is logged and listed in
//! `degraded`; the pass carries on with the state it has. Only a corrupt
//! task queue or a failed write of core state aborts the pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::circuit::{
    spawn_recovery_probes, CircuitPolicy, CircuitRegistry, CircuitState, PlatformEligibility,
    PlatformProbe, ProbeOutcome, Transition,
};
use crate::config::Config;
use crate::core::{TaskId, TaskQueue};
use crate::dedup::{self_dedup, DedupEngine, DedupRemoval};
use crate::hooks::{circuit_resource, HookHistory, HookInvocation, HookRunner, HookStatus, RunSummary};
use crate::replenish::{parse_backlog, ConsumedSignals, Replenisher, ReplenishReport, SignalSources};
use crate::selector::{Assignment, Selector};
use crate::store::{atomic_write, RecordSet, StateStore};
use crate::unblock::{auto_unblock, UnblockReport};
use crate::util;
use crate::{klog, klog_debug, klog_warn, Result};

/// Shared state for a pass, passed to every section.
pub struct PassContext {
    pub config: Config,
    pub store: StateStore,
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl PassContext {
    pub fn new(config: Config, store: StateStore) -> Self {
        Self {
            config,
            store,
            now: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Load config from the state directory and open the store there.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let config = Config::load(state_dir)?;
        Ok(Self::new(config, StateStore::open(state_dir)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    pub category: Option<String>,
    pub budget_cap: Option<f64>,
    pub hooks: Option<HookInvocation>,
    pub claim: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradedSection {
    pub section: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookRunSummary {
    pub run_id: String,
    #[serde(flatten)]
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub unblocked: UnblockReport,
    pub archived: Vec<TaskId>,
    pub deduplicated: Vec<DedupRemoval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookRunSummary>,
    pub replenish: ReplenishReport,
    pub assignment: Assignment,
    pub platforms: Vec<PlatformEligibility>,
    pub probes: Vec<ProbeOutcome>,
    pub circuit_transitions: Vec<Transition>,
    pub pending: usize,
    pub degraded: Vec<DegradedSection>,
}

impl PassSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            unblocked: UnblockReport::default(),
            archived: Vec::new(),
            deduplicated: Vec::new(),
            hooks: None,
            replenish: ReplenishReport::default(),
            assignment: Assignment::Idle,
            platforms: Vec::new(),
            probes: Vec::new(),
            circuit_transitions: Vec::new(),
            pending: 0,
            degraded: Vec::new(),
        }
    }

    fn degrade(&mut self, section: &'static str, error: impl std::fmt::Display) {
        klog_warn!("Pass section {} degraded: {}", section, error);
        self.degraded.push(DegradedSection {
            section,
            error: error.to_string(),
        });
    }
}

/// Load the circuit registry; a corrupt file falls back to all-closed.
pub fn load_circuits(store: &mut StateStore, config: &Config) -> (CircuitRegistry, Option<String>) {
    let policy = CircuitPolicy::from(&config.circuit);
    match store.load_json::<BTreeMap<String, CircuitState>>(RecordSet::Circuits) {
        Ok(records) => (CircuitRegistry::from_records(records, policy), None),
        Err(e) => (CircuitRegistry::new(policy), Some(e.to_string())),
    }
}

/// Write serialized record sets on a blocking thread, then invalidate them.
async fn persist(store: &mut StateStore, writes: Vec<(PathBuf, String)>) -> Result<()> {
    let paths: Vec<PathBuf> = writes.iter().map(|(p, _)| p.clone()).collect();
    util::blocking(move || {
        for (path, contents) in &writes {
            atomic_write(path, contents)?;
        }
        Ok(())
    })
    .await?;
    for path in &paths {
        store.invalidate(path);
    }
    Ok(())
}

pub async fn run_pass(ctx: &mut PassContext, options: PassOptions) -> Result<PassSummary> {
    let now = ctx.now;
    let mut summary = PassSummary::new(now);
    klog!("Pass started (category={:?})", options.category);

    // 1. Load
    let mut queue: TaskQueue = ctx.store.load_json(RecordSet::Tasks)?;
    let (mut circuits, circuit_err) = load_circuits(&mut ctx.store, &ctx.config);
    if let Some(e) = circuit_err {
        summary.degrade("load_circuits", e);
    }
    let history_path = ctx.store.path(RecordSet::HookResults);
    let mut history = match HookHistory::try_load(&mut ctx.store, &history_path) {
        Ok(history) => history,
        Err(e) => {
            summary.degrade("load_hook_history", e);
            HookHistory::default()
        }
    };
    let mut history_changed = false;

    // 2. Auto-unblock
    let blocker_timeout = Duration::from_secs(ctx.config.queue.blocker_timeout_secs);
    summary.unblocked = auto_unblock(&mut queue, blocker_timeout, &ctx.cancel).await;

    // 3. Archive
    let retention = chrono::Duration::hours(ctx.config.queue.retention_hours);
    summary.archived = queue.archive_closed(now, retention);

    // 4. Self-dedup
    let dedup = DedupEngine::new(ctx.config.dedup.clone());
    summary.deduplicated = self_dedup(&dedup, &mut queue, now);

    // 5. Recovery probes run in the background until step 10.
    let probes: Vec<(String, String)> = circuits
        .recovery_candidates(now)
        .into_iter()
        .filter_map(|resource| {
            let command = ctx.config.circuit.probes.get(&resource)?.clone();
            Some((resource, command))
        })
        .collect();
    let probe_handle = (!probes.is_empty()).then(|| {
        klog_debug!("Spawning {} recovery probes", probes.len());
        spawn_recovery_probes(
            probes,
            Duration::from_secs(ctx.config.circuit.probe_timeout_secs),
            ctx.cancel.child_token(),
        )
    });

    // 6. Hooks
    if let Some(mut invocation) = options.hooks.clone() {
        if invocation.category.is_none() {
            invocation.category = options.category.clone();
        }
        let outcome = HookRunner::new(&ctx.config.hooks, &history)
            .run(&invocation)
            .await;
        match outcome {
            Ok(run) => {
                for line in &run.log {
                    klog_debug!("{}", line);
                }
                for result in &run.record.results {
                    let resource = circuit_resource(&result.name);
                    let transition = match result.status {
                        HookStatus::Ok => circuits.record_success(&resource, now),
                        HookStatus::Fail(_) => {
                            circuits.record_failure(&resource, &result.error_excerpt, now)
                        }
                        HookStatus::BudgetSkip => None,
                    };
                    summary.circuit_transitions.extend(transition);
                }
                summary.hooks = Some(HookRunSummary {
                    run_id: run.record.run_id.clone(),
                    summary: run.record.summary.clone(),
                });
                history.push(run.record, ctx.config.hooks.history_window);
                history_changed = true;
            }
            Err(e) => summary.degrade("hooks", e),
        }
    }

    // 7. Replenish
    let sources = SignalSources::load(&mut ctx.store);
    let replenisher = Replenisher::new(&ctx.config.replenish, &ctx.config.queue, &dedup);
    let consumed = match replenisher.run(&mut queue, &sources, &history, now) {
        Ok(outcome) => {
            summary.replenish = outcome.report;
            outcome.consumed
        }
        Err(e) => {
            summary.degrade("replenish", e);
            ConsumedSignals::default()
        }
    };

    // 8. Select
    let backlog_text = consumed.backlog.as_ref().or(sources.backlog.as_ref());
    let backlog = backlog_text.map(|t| parse_backlog(t)).unwrap_or_default();
    let selector = Selector::new(&ctx.config.queue, &dedup);
    summary.assignment = selector.select_next(&queue, options.budget_cap, &backlog);
    if options.claim {
        if let Some(id) = summary.assignment.task_id() {
            if let Err(e) = queue.claim(id) {
                summary.degrade("claim", e);
            }
        }
    }

    // 9. Platforms
    let platforms: Vec<PlatformProbe> = ctx.store.load_json_lenient(RecordSet::Platforms);
    summary.platforms = circuits.rank_platforms(&platforms);

    // 10. Join probes
    if let Some(handle) = probe_handle {
        match handle.await {
            Ok(outcomes) => {
                let transitions = circuits.apply_probe_outcomes(&outcomes, now);
                summary.circuit_transitions.extend(transitions);
                summary.probes = outcomes;
            }
            Err(e) => summary.degrade("recovery_probes", e),
        }
    }

    // 11. Persist
    summary.pending = queue.pending_count();
    let mut writes = vec![
        (ctx.store.path(RecordSet::Tasks), serde_json::to_string_pretty(&queue)?),
        (
            ctx.store.path(RecordSet::Circuits),
            serde_json::to_string_pretty(circuits.records())?,
        ),
    ];
    if history_changed {
        writes.push((history_path, serde_json::to_string_pretty(history.records())?));
    }
    persist(&mut ctx.store, writes).await?;
    if !consumed.is_empty() {
        if let Err(e) = consumed.persist(&mut ctx.store) {
            summary.degrade("consume_signals", e);
        }
    }

    klog!(
        "Pass finished: {} pending, {} promoted, {} degraded sections",
        summary.pending,
        summary.replenish.promoted.len(),
        summary.degraded.len()
    );
    Ok(summary)
}
