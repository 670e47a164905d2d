//! State store and CLI integration tests.
//!
//! These tests verify that every write leaves a backup and no temp file,
//! that the read cache observes writes made through the store, and that
//! the binary works against a state directory end to end.

use std::process::Command;

use chrono::Utc;

use keel::core::TaskQueue;
use keel::pass::{run_pass, PassOptions};
use keel::store::RecordSet;

use crate::fixtures::{TestState, SEED_TASKS};

fn keel(state: &TestState, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_keel"))
        .arg("--state-dir")
        .arg(&state.path)
        .args(args)
        .output()
        .expect("Failed to run keel binary")
}

/// Test: Atomic replacement
/// Given a queue written twice
/// When the second write lands
/// Then the previous version is kept as .bak and no .tmp remains
#[test]
fn test_write_keeps_backup_and_no_temp() {
    let state = TestState::new();
    state.seed_tasks(&SEED_TASKS[..1]);
    state.seed_tasks(&SEED_TASKS[1..2]);

    let backup: TaskQueue =
        serde_json::from_str(&state.read("work-queue.json.bak")).unwrap();
    assert_eq!(backup.titles(), vec![SEED_TASKS[0].to_string()]);
    assert_eq!(state.queue().titles().len(), 2);
    assert!(!state.path.join("work-queue.json.tmp").exists());
}

/// Test: The pass writes through the cache
/// Given a store that has already read the queue
/// When a pass in the same context changes and persists it
/// Then a later read in that context sees the new queue
#[test]
fn test_pass_invalidates_cached_reads() {
    let state = TestState::new();
    state.write_backlog(&["Add jittered retry to the forum client", "Prune stale platform credentials"]);
    let mut ctx = state.context();
    let before: TaskQueue = ctx.store.load_json(RecordSet::Tasks).unwrap();
    assert!(before.queue.is_empty());

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let summary = runtime
        .block_on(run_pass(&mut ctx, PassOptions::default()))
        .unwrap();
    assert_eq!(summary.replenish.promoted.len(), 1);

    let after: TaskQueue = ctx.store.load_json(RecordSet::Tasks).unwrap();
    assert_eq!(after.queue.len(), 1);
    let backlog_path = ctx.store.path(RecordSet::Backlog);
    let backlog = ctx.store.read_text_at(&backlog_path).unwrap().unwrap();
    assert!(backlog.contains("~~Add jittered retry to the forum client~~"));
}

/// Test: Consecutive passes reuse nothing stale
/// Given a task completed between two passes by another writer
/// When the second pass runs with a fresh context
/// Then it sees the completion
#[test]
fn test_fresh_context_reads_external_writes() {
    let state = TestState::new();
    let ids = state.seed_tasks(&SEED_TASKS[..1]);

    let first = tokio_test::block_on(async {
        let mut ctx = state.context();
        run_pass(&mut ctx, PassOptions::default()).await
    })
    .unwrap();
    assert_eq!(first.assignment.task_id(), Some(ids[0]));

    let mut queue = state.queue();
    queue.complete(ids[0], Utc::now()).unwrap();
    state.save_queue(&queue);

    let second = tokio_test::block_on(async {
        let mut ctx = state.context();
        run_pass(&mut ctx, PassOptions::default()).await
    })
    .unwrap();
    assert_eq!(second.pending, 0);
    assert!(second.assignment.task_id().is_none());
}

/// Test: CLI task lifecycle
/// Given an empty state directory
/// When tasks are added, one with a dependency, and the first is completed
/// Then the CLI reports which tasks it unblocks and select picks the next
#[test]
fn test_cli_task_lifecycle() {
    let state = TestState::new();

    let out = keel(&state, &["task", "add", "Migrate ledger storage", "--priority", "2"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "Added wq-001");

    let out = keel(&state, &["task", "add", "Drop legacy ledger tables", "--dep", "wq-001"]);
    assert!(out.status.success());

    let out = keel(&state, &["select"]);
    let assignment: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(assignment["id"], "wq-001");

    let out = keel(&state, &["task", "done", "wq-001"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Unblocks: wq-002"), "stdout: {}", stdout);

    let queue = state.queue();
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.titles(), vec!["Migrate ledger storage", "Drop legacy ledger tables"]);
}

/// Test: Missing hooks directory is not an error
#[test]
fn test_cli_missing_hooks_dir_exits_zero() {
    let state = TestState::new();
    let missing = state.path.join("no-hooks");
    let out = keel(&state, &["hooks", missing.to_str().unwrap(), "30"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("hooks dir not found"));
}

/// Test: Usage errors exit 2
#[test]
fn test_cli_bad_arguments() {
    let state = TestState::new();
    let out = keel(&state, &["hooks"]);
    assert_eq!(out.status.code(), Some(2));
    let out = keel(&state, &["circuit", "record", "platform:forum"]);
    assert_eq!(out.status.code(), Some(2));
}

/// Test: Circuit CLI records and persists
#[test]
fn test_cli_circuit_record() {
    let state = TestState::new();
    for _ in 0..3 {
        let out = keel(&state, &["circuit", "record", "platform:forum", "--fail", "HTTP 503"]);
        assert!(out.status.success());
    }
    let out = keel(&state, &["circuit", "status"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("platform:forum"));
    assert!(stdout.contains("open"));
    assert!(stdout.contains("last error: HTTP 503"));
}
