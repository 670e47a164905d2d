//! Orchestration pass integration tests.
//!
//! These tests verify the section order of a pass: unblock, archive,
//! dedup, selection and the single write at the end.

use chrono::{Duration as ChronoDuration, Utc};

use keel::core::{NewTask, TaskStatus};
use keel::pass::{run_pass, PassOptions};
use keel::selector::Assignment;
use keel::store::RecordSet;

use crate::fixtures::{TestState, BACKLOG_IDEAS};

/// Test: Urgent tag beats priority
/// Given task A (priority 1) and task B (priority 5, tagged urgent)
/// When a pass selects
/// Then B is assigned
#[tokio::test]
async fn test_urgent_task_selected_first() {
    let state = TestState::new();
    let mut queue = state.queue();
    let mut a = NewTask::titled("Migrate ledger storage", "manual");
    a.priority = 1;
    queue.add(a, Utc::now()).unwrap();
    let mut b = NewTask::titled("Rotate leaked platform token", "manual").with_tag("urgent");
    b.priority = 5;
    let b_id = queue.add(b, Utc::now()).unwrap();
    state.save_queue(&queue);

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert_eq!(summary.assignment.task_id(), Some(b_id));
}

/// Test: Dependencies gate selection
/// Given a high-priority task depending on a pending one
/// When a pass selects
/// Then the dependency is selected; after it is done and archived the
/// dependent becomes selectable
#[tokio::test]
async fn test_dependency_gates_until_archived() {
    let state = TestState::new();
    let mut queue = state.queue();
    let base = queue
        .add(NewTask::titled("Migrate ledger storage", "manual"), Utc::now())
        .unwrap();
    let mut dependent = NewTask::titled("Drop legacy ledger tables", "manual").with_tag("urgent");
    dependent.dependencies = vec![base];
    let dependent_id = queue.add(dependent, Utc::now()).unwrap();
    state.save_queue(&queue);

    let mut ctx = state.context();
    let first = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert_eq!(first.assignment.task_id(), Some(base));

    // Complete the dependency long enough ago to be archived.
    let mut queue = state.queue();
    queue.complete(base, Utc::now() - ChronoDuration::hours(48)).unwrap();
    state.save_queue(&queue);

    let mut ctx = state.context();
    let second = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert_eq!(second.archived, vec![base]);
    assert_eq!(second.assignment.task_id(), Some(dependent_id));

    let saved = state.queue();
    assert!(saved.get(base).is_none());
    assert!(saved.is_archived(base));
}

/// Test: Auto-unblock before selection
/// Given the only task is blocked on a passing check
/// When a pass runs
/// Then the task is promoted to pending and selected in the same pass
#[cfg(unix)]
#[tokio::test]
async fn test_auto_unblock_feeds_selection() {
    let state = TestState::new();
    let mut queue = state.queue();
    let mut new = NewTask::titled("Publish weekly digest", "manual");
    new.blocker_check = Some("test -d /".to_string());
    let id = queue.add(new, Utc::now()).unwrap();
    state.save_queue(&queue);

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert_eq!(summary.unblocked.promoted, vec![id]);
    assert_eq!(summary.assignment.task_id(), Some(id));
    let task = state.queue().get(id).cloned().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.blocker_check.is_none());
}

/// Test: Self-dedup is idempotent across passes
/// Given three pending tasks, two of them near-duplicates
/// When two passes run back to back
/// Then the first archives one duplicate and the second removes nothing
#[tokio::test]
async fn test_self_dedup_idempotent_across_passes() {
    let state = TestState::new();
    let ids = state.seed_tasks(&[
        "Add retry budget for platform probes",
        "Harden config loader",
        "Add retry budget for the platform probes",
    ]);

    let mut ctx = state.context();
    let first = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert_eq!(first.deduplicated.len(), 1);
    assert_eq!(first.deduplicated[0].removed, ids[2]);
    assert_eq!(first.deduplicated[0].kept, ids[0]);

    let mut ctx = state.context();
    let second = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert!(second.deduplicated.is_empty());

    let archived = state.queue();
    let removed = archived.archive.iter().find(|t| t.id == ids[2]).unwrap();
    assert_eq!(removed.status, TaskStatus::Retired);
}

/// Test: Fallback to the backlog when nothing is selectable
/// Given one backlog idea and no tasks
/// When a pass runs
/// Then the idea is offered as a fallback instead of being promoted
#[tokio::test]
async fn test_single_idea_becomes_fallback() {
    let state = TestState::new();
    state.write_backlog(&BACKLOG_IDEAS[..1]);

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert!(summary.replenish.promoted.is_empty());
    match summary.assignment {
        Assignment::Fallback { idea } => assert_eq!(idea.title, BACKLOG_IDEAS[0]),
        other => panic!("Expected fallback, got {:?}", other),
    }
}

/// Test: Summary is JSON with a kind-tagged assignment
#[tokio::test]
async fn test_summary_serializes() {
    let state = TestState::new();
    state.seed_tasks(&["Harden config loader"]);
    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["assignment"]["kind"], "task");
    assert_eq!(json["assignment"]["id"], "wq-001");
    assert_eq!(json["pending"], 1);
    assert!(json["degraded"].as_array().unwrap().is_empty());
}

/// Test: Corrupt signal sources never fail the pass
/// Given unparseable follow-up, observation and friction files
/// When a pass runs
/// Then it completes and promotes nothing from them
#[tokio::test]
async fn test_malformed_signal_sources_are_skipped() {
    let state = TestState::new();
    state.seed_tasks(&["Harden config loader"]);
    for set in [RecordSet::Followups, RecordSet::Observations, RecordSet::Friction] {
        std::fs::write(state.path.join(set.file_name()), "{{{ not json").unwrap();
    }

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert!(summary.replenish.promoted.is_empty());
    assert!(summary.degraded.is_empty());
}
