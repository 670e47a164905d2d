//! Replenishment integration tests.
//!
//! These tests run full passes against signal files and verify the
//! dynamic buffer, the quality gates and that every processed signal is
//! consumed in the same pass.

use std::collections::BTreeMap;

use chrono::Utc;

use keel::pass::{run_pass, PassOptions};
use keel::replenish::{parse_backlog, FrictionData, RejectedSignal, SignalEntry, SignalSource};
use keel::store::RecordSet;

use crate::fixtures::{TestState, BACKLOG_IDEAS, SEED_TASKS};

/// Test: Dynamic buffer with an empty queue
/// Given 0 pending tasks and 4 backlog ideas
/// When a pass runs
/// Then 3 ideas are promoted and 1 stays in the backlog as the buffer
#[tokio::test]
async fn test_empty_queue_promotes_three_of_four() {
    let state = TestState::new();
    state.write_backlog(&BACKLOG_IDEAS);

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert_eq!(summary.replenish.promoted.len(), 3);
    assert!(summary
        .replenish
        .promoted
        .iter()
        .all(|p| p.source == SignalSource::Backlog));
    assert_eq!(summary.pending, 3);

    let backlog = state.read("backlog.md");
    let open = parse_backlog(&backlog);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].title, BACKLOG_IDEAS[3]);
    assert!(backlog.contains(&format!("- ~~{}~~ -> wq-001", BACKLOG_IDEAS[0])));
}

/// Test: Dynamic buffer near the floor
/// Given 2 pending tasks and 3 backlog ideas
/// When a pass runs
/// Then exactly 1 idea is promoted
#[tokio::test]
async fn test_near_floor_promotes_one() {
    let state = TestState::new();
    state.seed_tasks(&SEED_TASKS[..2]);
    state.write_backlog(&BACKLOG_IDEAS[..3]);

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert_eq!(summary.replenish.promoted.len(), 1);
    assert_eq!(parse_backlog(&state.read("backlog.md")).len(), 2);
}

/// Test: A promoted idea is never promoted twice
/// Given a pass that promoted backlog ideas
/// When a second pass runs on the rewritten backlog
/// Then nothing already promoted is promoted again
#[tokio::test]
async fn test_backlog_consumed_once() {
    let state = TestState::new();
    state.write_backlog(&BACKLOG_IDEAS);

    let mut ctx = state.context();
    run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    let mut ctx = state.context();
    let second = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    // 3 pending at the floor: nothing more to promote.
    assert!(second.replenish.promoted.is_empty());
    let titles = state.queue().titles();
    assert_eq!(titles.len(), 3);
}

/// Test: A duplicate idea is consumed, not left for later
/// Given a backlog idea that duplicates a live task
/// When that task is completed and archived before the next pass
/// Then the idea was struck through as a duplicate and is never promoted
#[tokio::test]
async fn test_duplicate_idea_not_promoted_after_archive() {
    let state = TestState::new();
    let ids = state.seed_tasks(&BACKLOG_IDEAS[..1]);
    state.write_backlog(&BACKLOG_IDEAS);

    let mut ctx = state.context();
    let first = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert_eq!(first.replenish.duplicates, 1);
    let backlog = state.read("backlog.md");
    assert!(backlog.contains(&format!("- ~~{}~~ -> dup:{}", BACKLOG_IDEAS[0], ids[0])));

    let mut queue = state.queue();
    let live: Vec<_> = queue.queue.iter().map(|t| t.id).collect();
    for id in live {
        queue.complete(id, Utc::now()).unwrap();
        queue.archive_task(id);
    }
    state.save_queue(&queue);

    let mut ctx = state.context();
    let second = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert!(second.replenish.promoted.is_empty());

    let queue = state.queue();
    let copies = queue
        .known_titles()
        .iter()
        .filter(|t| t.as_str() == BACKLOG_IDEAS[0])
        .count();
    assert_eq!(copies, 1);
}

/// Test: Observational language is rejected
/// Given the observation "This pattern mirrors the resource lifecycle of
/// the registry"
/// When a pass runs
/// Then it is rejected by the observational rule, logged, and drained
#[tokio::test]
async fn test_observational_signal_rejected_and_logged() {
    let state = TestState::new();
    state.seed_tasks(&SEED_TASKS);
    state.write_json(
        RecordSet::Observations,
        &vec![
            SignalEntry::new("This pattern mirrors the resource lifecycle of the registry", "s7"),
            SignalEntry::new("Add cost ceiling alerts for engagement sessions", "s7"),
        ],
    );

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    assert_eq!(summary.replenish.rejected.len(), 1);
    assert_eq!(summary.replenish.rejected[0].rule, "observational_language");
    assert_eq!(summary.replenish.promoted.len(), 1);
    assert_eq!(summary.replenish.promoted[0].source, SignalSource::Observation);

    let remaining: Vec<SignalEntry> =
        serde_json::from_str(&state.read("observations.json")).unwrap();
    assert!(remaining.is_empty());
    let rejected: Vec<RejectedSignal> =
        serde_json::from_str(&state.read("observations-rejected.json")).unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].entry.origin, "s7");
}

/// Test: Observation promotions are capped per pass
/// Given four actionable observations
/// When a pass runs
/// Then two are promoted and two wait for the next pass
#[tokio::test]
async fn test_observation_cap() {
    let state = TestState::new();
    state.seed_tasks(&SEED_TASKS);
    state.write_json(
        RecordSet::Observations,
        &vec![
            SignalEntry::new("Add cost ceiling alerts for engagement sessions", "a"),
            SignalEntry::new("Fix duplicate notifications from the inbox poller", "b"),
            SignalEntry::new("Replace polling with webhooks for mentions", "c"),
            SignalEntry::new("Cache platform directory lookups", "d"),
        ],
    );

    let mut ctx = state.context();
    let first = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    assert_eq!(first.replenish.promoted.len(), 2);

    let mut ctx = state.context();
    let second = run_pass(&mut ctx, PassOptions::default()).await.unwrap();
    let origins: Vec<String> = second
        .replenish
        .promoted
        .iter()
        .map(|p| p.title.clone())
        .collect();
    assert_eq!(
        origins,
        vec![
            "Replace polling with webhooks for mentions".to_string(),
            "Cache platform directory lookups".to_string()
        ]
    );
}

/// Test: Follow-ups and friction bypass the buffer
/// Given a full queue, one follow-up and a churned resource
/// When a pass runs
/// Then both are promoted with their source tags and follow-ups are drained
#[tokio::test]
async fn test_followups_and_friction_promoted() {
    let state = TestState::new();
    state.seed_tasks(&SEED_TASKS);
    state.write_json(
        RecordSet::Followups,
        &vec![SignalEntry::new("Fix probe timeout for the forum platform", "session-9")],
    );
    let mut touches = BTreeMap::new();
    touches.insert("src/engage.rs".to_string(), 8);
    state.write_json(
        RecordSet::Friction,
        &FrictionData {
            touches,
            trends: BTreeMap::new(),
        },
    );

    let mut ctx = state.context();
    let summary = run_pass(&mut ctx, PassOptions::default()).await.unwrap();

    let sources: Vec<SignalSource> = summary.replenish.promoted.iter().map(|p| p.source).collect();
    assert_eq!(sources, vec![SignalSource::Followup, SignalSource::Friction]);

    let queue = state.queue();
    let friction = queue.get(summary.replenish.promoted[1].id).unwrap();
    assert!(friction.has_tag("friction"));
    assert_eq!(friction.title, "Refactor src/engage.rs to reduce churn (8 touches)");

    let followups: Vec<SignalEntry> = serde_json::from_str(&state.read("followups.json")).unwrap();
    assert!(followups.is_empty());
}
