use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};

use keel::circuit::BreakerState;
use keel::config::Config;
use keel::core::{
    unsatisfied_deps, Complexity, DependencyGraph, NewTask, TaskId, TaskQueue, TaskStatus,
};
use keel::dedup::DedupEngine;
use keel::hooks::{health_report, HookHistory, HookInvocation, HookRunner};
use keel::log::LogLevel;
use keel::pass::{load_circuits, run_pass, PassContext, PassOptions};
use keel::replenish::parse_backlog;
use keel::selector::Selector;
use keel::store::{RecordSet, StateStore};
use keel::{klog, klog_error, Result};

/// Keel - control plane for an autonomous agent loop
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KEEL_HOME=DIR   State directory (default ~/.keel)\n    KEEL_DEBUG=1    Enable debug logging (alternative to --debug)\n    KEEL_LOG=LEVEL  Log level: error, warn, info, debug or trace")]
pub struct Cli {
    /// State directory (overrides KEEL_HOME)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable debug logging (writes to <state-dir>/keel.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Log subprocess detail as well
    #[arg(long, global = true)]
    pub trace: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run one orchestration pass and print its summary as JSON
    Pass {
        /// Invocation category (selects affinity-suffixed hooks)
        #[arg(long)]
        category: Option<String>,

        /// Remaining budget; below the threshold large tasks are avoided
        #[arg(long)]
        budget_cap: Option<f64>,

        /// Hooks directory to run during the pass
        #[arg(long, requires = "hook_timeout")]
        hooks_dir: Option<PathBuf>,

        /// Default per-hook timeout in seconds
        #[arg(long)]
        hook_timeout: Option<u64>,

        /// Aggregate hook budget in seconds
        #[arg(long)]
        hook_budget: Option<u64>,

        /// Run hooks in batches of this size
        #[arg(long)]
        parallel: Option<usize>,

        /// Mark the selected task in-progress
        #[arg(long)]
        claim: bool,
    },

    /// Run a directory of hooks
    Hooks {
        dir: PathBuf,

        /// Default per-hook timeout in seconds
        timeout_secs: u64,

        /// Append the run to FILE under RUN_ID
        #[arg(long, num_args = 2, value_names = ["FILE", "RUN_ID"])]
        track: Option<Vec<String>>,

        /// Aggregate budget in seconds
        #[arg(long)]
        budget: Option<u64>,

        /// Run in batches of this size
        #[arg(long)]
        parallel: Option<usize>,

        /// Invocation category
        #[arg(long)]
        category: Option<String>,
    },

    /// Show what would be selected next without changing anything
    Select {
        #[arg(long)]
        budget_cap: Option<f64>,
    },

    /// Manage queue tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Inspect or update circuit breakers
    Circuit {
        #[command(subcommand)]
        action: CircuitAction,
    },

    /// Hook health over recent tracked runs
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Queue counts, open circuits and the last hook run
    Status,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// Add a task
    Add {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 5)]
        priority: i64,
        #[arg(long, default_value = "M")]
        complexity: Complexity,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "dep")]
        deps: Vec<TaskId>,
        /// Shell predicate; the task stays blocked until it exits 0
        #[arg(long)]
        blocker_check: Option<String>,
    },
    /// Mark a task done
    Done { id: TaskId },
    /// Mark a pending task in-progress
    Claim { id: TaskId },
    /// Retire a task without completing it
    Retire {
        id: TaskId,
        #[arg(long, default_value = "retired by operator")]
        reason: String,
    },
    /// Append a progress note
    Note {
        id: TaskId,
        text: String,
        #[arg(long, default_value = "note")]
        marker: String,
    },
    /// Block a task on a shell predicate
    Block { id: TaskId, check: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CircuitAction {
    /// List every circuit
    Status,
    /// Record a success or failure for a resource
    Record {
        resource: String,
        #[arg(long, conflicts_with = "fail", required_unless_present = "fail")]
        ok: bool,
        #[arg(long)]
        fail: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let state_dir = Config::state_dir(cli.state_dir.as_deref())?;
    keel::log::init_with_debug(&state_dir, cli.debug);
    if cli.trace {
        keel::log::set_level(LogLevel::Trace);
    }
    klog!("keel {:?} (state dir {})", cli.command, state_dir.display());

    let result = match cli.command {
        Command::Pass {
            category,
            budget_cap,
            hooks_dir,
            hook_timeout,
            hook_budget,
            parallel,
            claim,
        } => {
            let hooks = hooks_dir.map(|dir| HookInvocation {
                budget: hook_budget.map(Duration::from_secs),
                parallel,
                category: category.clone(),
                ..HookInvocation::new(dir, Duration::from_secs(hook_timeout.unwrap_or(60)))
            });
            let options = PassOptions {
                category,
                budget_cap,
                hooks,
                claim,
            };
            run_pass_command(&state_dir, options)
        }
        Command::Hooks {
            dir,
            timeout_secs,
            track,
            budget,
            parallel,
            category,
        } => {
            let invocation = HookInvocation {
                budget: budget.map(Duration::from_secs),
                parallel,
                category,
                ..HookInvocation::new(dir, Duration::from_secs(timeout_secs))
            };
            run_hooks(&state_dir, invocation, track)
        }
        Command::Select { budget_cap } => run_select(&state_dir, budget_cap),
        Command::Task { action } => run_task(&state_dir, action),
        Command::Circuit { action } => run_circuit(&state_dir, action),
        Command::Health { json } => run_health(&state_dir, json),
        Command::Status => run_status(&state_dir),
    };
    if let Err(e) = &result {
        klog_error!("Fatal: {}", e);
    }
    result
}

fn run_pass_command(state_dir: &std::path::Path, options: PassOptions) -> Result<()> {
    let mut ctx = PassContext::open(state_dir)?;
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(run_pass(&mut ctx, options))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_hooks(
    state_dir: &std::path::Path,
    mut invocation: HookInvocation,
    track: Option<Vec<String>>,
) -> Result<()> {
    if !invocation.dir.is_dir() {
        println!(
            "hooks dir not found: {} (nothing to run)",
            invocation.dir.display()
        );
        return Ok(());
    }
    let config = Config::load(state_dir)?;
    let mut store = StateStore::open(state_dir);

    let tracked = track.and_then(|values| match values.as_slice() {
        [file, run_id] => Some((PathBuf::from(file), run_id.clone())),
        _ => None,
    });
    let mut history = match &tracked {
        Some((file, run_id)) => {
            invocation.run_id = Some(run_id.clone());
            HookHistory::load(&mut store, file)
        }
        None => HookHistory::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let run = rt.block_on(HookRunner::new(&config.hooks, &history).run(&invocation))?;
    for line in &run.log {
        println!("{}", line);
    }
    let summary = &run.record.summary;
    println!(
        "hooks: {} ok, {} failed, {} skipped ({}ms)",
        summary.ok, summary.fail, summary.skip, summary.total_ms
    );

    if let Some((file, _)) = tracked {
        history.push(run.record, config.hooks.history_window);
        history.save(&mut store, &file)?;
    }
    Ok(())
}

fn run_select(state_dir: &std::path::Path, budget_cap: Option<f64>) -> Result<()> {
    let config = Config::load(state_dir)?;
    let mut store = StateStore::open(state_dir);
    let queue: TaskQueue = store.load_json(RecordSet::Tasks)?;
    let backlog_path = store.path(RecordSet::Backlog);
    let backlog = store
        .read_text_at(&backlog_path)
        .ok()
        .flatten()
        .map(|text| parse_backlog(&text))
        .unwrap_or_default();

    let dedup = DedupEngine::new(config.dedup.clone());
    let assignment = Selector::new(&config.queue, &dedup).select_next(&queue, budget_cap, &backlog);
    println!("{}", serde_json::to_string_pretty(&assignment)?);
    Ok(())
}

fn run_task(state_dir: &std::path::Path, action: TaskAction) -> Result<()> {
    let mut store = StateStore::open(state_dir);
    let mut queue: TaskQueue = store.load_json(RecordSet::Tasks)?;
    let now = Utc::now();

    match action {
        TaskAction::Add {
            title,
            description,
            priority,
            complexity,
            tags,
            deps,
            blocker_check,
        } => {
            let new = NewTask {
                title,
                description,
                priority,
                complexity,
                tags: tags.into_iter().collect(),
                dependencies: deps,
                blocker_check,
                source: "manual".to_string(),
            };
            let id = queue.add(new, now)?;
            println!("Added {}", id);
        }
        TaskAction::Done { id } => {
            queue.complete(id, now)?;
            println!("Completed {}", id);
            let waiting: Vec<String> = DependencyGraph::build(&queue)
                .dependents(id)
                .into_iter()
                .map(|d| d.to_string())
                .collect();
            if !waiting.is_empty() {
                println!("  Unblocks: {}", waiting.join(", "));
            }
        }
        TaskAction::Claim { id } => {
            queue.claim(id)?;
            println!("Claimed {}", id);
        }
        TaskAction::Retire { id, reason } => {
            queue.retire(id, &reason, now)?;
            println!("Retired {}", id);
        }
        TaskAction::Note { id, text, marker } => {
            queue.add_note(id, &marker, &text)?;
            println!("Noted {}", id);
        }
        TaskAction::Block { id, check } => {
            queue.block(id, &check)?;
            println!("Blocked {} on: {}", id, check);
        }
    }

    store.write_json(RecordSet::Tasks, &queue)
}

fn run_circuit(state_dir: &std::path::Path, action: CircuitAction) -> Result<()> {
    let config = Config::load(state_dir)?;
    let mut store = StateStore::open(state_dir);
    let (mut circuits, err) = load_circuits(&mut store, &config);
    if let Some(e) = err {
        println!("warning: circuits file unreadable, starting fresh: {}", e);
    }

    match action {
        CircuitAction::Status => {
            if circuits.records().is_empty() {
                println!("No circuits recorded");
            }
            for (resource, state) in circuits.records() {
                println!(
                    "  {:<28} {:<10} fails={}/{} ok={}{}",
                    resource,
                    state.state.to_string(),
                    state.consecutive_failures,
                    state.total_failures,
                    state.total_successes,
                    state
                        .last_error
                        .as_deref()
                        .map(|e| format!("  last error: {}", e))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        CircuitAction::Record { resource, ok, fail } => {
            let now = Utc::now();
            let transition = match (ok, fail) {
                (true, _) => circuits.record_success(&resource, now),
                (false, Some(error)) => circuits.record_failure(&resource, &error, now),
                (false, None) => None,
            };
            println!("{}: {}", resource, circuits.state_of(&resource));
            if let Some(t) = transition {
                println!("  transition: {} -> {}", t.from, t.to);
            }
            store.write_json(RecordSet::Circuits, circuits.records())
        }
    }
}

fn run_health(state_dir: &std::path::Path, json: bool) -> Result<()> {
    let mut store = StateStore::open(state_dir);
    let path = store.path(RecordSet::HookResults);
    let report = health_report(&HookHistory::load(&mut store, &path));
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.is_empty() {
        println!("No tracked hook runs");
        return Ok(());
    }
    println!("{:<32} {:>5} {:>5} {:>6}  {:<8} LAST FAILURE", "HOOK", "RUNS", "FAILS", "RATE", "STATUS");
    for h in &report {
        println!(
            "{:<32} {:>5} {:>5} {:>5.0}%  {:<8} {}",
            h.name,
            h.runs,
            h.fails,
            h.fail_rate * 100.0,
            h.status.to_string(),
            h.last_failure
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn run_status(state_dir: &std::path::Path) -> Result<()> {
    let config = Config::load(state_dir)?;
    let mut store = StateStore::open(state_dir);
    let queue: TaskQueue = store.load_json(RecordSet::Tasks)?;

    println!("Queue ({}):", state_dir.display());
    for status in [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Retired,
    ] {
        println!("  {:<12} {}", status.to_string(), queue.count(status));
    }
    println!("  {:<12} {}", "archived", queue.archive.len());

    let graph = DependencyGraph::build(&queue);
    if let Err(e) = graph.validate() {
        println!("  warning: {}", e);
    }
    for task in queue.queue.iter().filter(|t| t.status == TaskStatus::Pending) {
        let waiting = unsatisfied_deps(task, &queue);
        if !waiting.is_empty() {
            let ids: Vec<String> = waiting.iter().map(|id| id.to_string()).collect();
            println!("  {} waits on {}", task.id, ids.join(", "));
        }
    }

    let (circuits, _) = load_circuits(&mut store, &config);
    let tripped: Vec<String> = circuits
        .records()
        .iter()
        .filter(|(_, c)| c.state != BreakerState::Closed)
        .map(|(id, c)| format!("{} ({})", id, c.state))
        .collect();
    println!(
        "Circuits: {} tracked, {} not closed{}",
        circuits.records().len(),
        tripped.len(),
        if tripped.is_empty() {
            String::new()
        } else {
            format!(": {}", tripped.join(", "))
        }
    );

    let path = store.path(RecordSet::HookResults);
    match HookHistory::load(&mut store, &path).last_run() {
        Some(run) => println!(
            "Last hook run: {} at {} ({} ok, {} failed, {} skipped)",
            run.run_id,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.summary.ok,
            run.summary.fail,
            run.summary.skip
        ),
        None => println!("Last hook run: none"),
    }
    Ok(())
}
