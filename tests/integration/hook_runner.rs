//! Hook runner integration tests.
//!
//! These tests run real shell scripts and verify budget backpressure,
//! timeout penalties across tracked runs, parallel batches and the hard
//! deadline.

use std::time::{Duration, Instant};

use keel::config::HooksConfig;
use keel::hooks::{
    FailureCategory, HookHistory, HookInvocation, HookRunner, HookStatus, TimeoutSource,
};

use crate::fixtures::{write_hook, TestState};

fn statuses(run: &keel::hooks::HookRun) -> Vec<(String, HookStatus)> {
    run
        .record
        .results
        .iter()
        .map(|r| (r.name.clone(), r.status))
        .collect()
}

/// Test: Budget backpressure
/// Given a budget of 0.5s and a first check that takes 1s
/// When the runner executes sequentially
/// Then every later check is recorded as budget_skip and never invoked
#[tokio::test]
async fn test_budget_exhaustion_skips_remaining() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    let marker = state.path.join("ran");
    write_hook(&dir, "10-slow.sh", "sleep 1");
    write_hook(&dir, "20-touch.sh", &format!("touch {}", marker.display()));
    write_hook(&dir, "30-touch.sh", &format!("touch {}", marker.display()));

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let invocation = HookInvocation {
        budget: Some(Duration::from_millis(500)),
        ..HookInvocation::new(&dir, Duration::from_secs(10))
    };
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();

    assert_eq!(
        statuses(&run),
        vec![
            ("10-slow.sh".to_string(), HookStatus::Ok),
            ("20-touch.sh".to_string(), HookStatus::BudgetSkip),
            ("30-touch.sh".to_string(), HookStatus::BudgetSkip),
        ]
    );
    assert!(!marker.exists(), "Skipped hooks must not run");
    assert_eq!(run.record.summary.skip, 2);
    assert!(run.log.iter().any(|l| l.ends_with("hook SKIPPED (budget): 20-touch.sh")));
}

/// Test: Timeout penalty decays after one run
/// Given a check that times out in run N
/// When runs N+1 and N+2 execute with tracked history
/// Then N+1 uses the halved timeout and N+2 reverts to the default
#[tokio::test]
async fn test_timeout_penalty_decay() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    let slow_flag = state.path.join("slow");
    std::fs::write(&slow_flag, "").unwrap();
    write_hook(
        &dir,
        "10-flaky.sh",
        &format!("if [ -f {} ]; then sleep 5; fi", slow_flag.display()),
    );

    let config = HooksConfig {
        penalty_floor_secs: 1,
        ..HooksConfig::default()
    };
    let mut history = HookHistory::default();
    let invocation = HookInvocation::new(&dir, Duration::from_secs(2));

    // Run N: times out at the 2s default.
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();
    let result = &run.record.results[0];
    assert_eq!(result.status, HookStatus::Fail(124));
    assert_eq!(result.failure_category, Some(FailureCategory::Timeout));
    assert_eq!(result.timeout_source, Some(TimeoutSource::Default));
    history.push(run.record, config.history_window);

    // Run N+1: penalized to 1s; the check is fast now.
    std::fs::remove_file(&slow_flag).unwrap();
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();
    let result = &run.record.results[0];
    assert_eq!(result.status, HookStatus::Ok);
    assert_eq!(result.timeout_source, Some(TimeoutSource::Penalty));
    assert_eq!(result.timeout_secs, 1);
    history.push(run.record, config.history_window);

    // Run N+2: back to normal.
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();
    let result = &run.record.results[0];
    assert_eq!(result.timeout_source, Some(TimeoutSource::Default));
    assert_eq!(result.timeout_secs, 2);
}

/// Test: Bounded-parallel batches
/// Given four 1s checks and a batch size of 2
/// When the runner executes in parallel mode
/// Then it takes about two batch durations, not four
#[tokio::test]
async fn test_parallel_batches() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    for name in ["10-a.sh", "20-b.sh", "30-c.sh", "40-d.sh"] {
        write_hook(&dir, name, "sleep 1");
    }

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let invocation = HookInvocation {
        parallel: Some(2),
        ..HookInvocation::new(&dir, Duration::from_secs(10))
    };
    let started = Instant::now();
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.record.summary.ok, 4);
    assert!(elapsed >= Duration::from_millis(1900), "Batches must not overlap");
    assert!(elapsed < Duration::from_millis(3500), "Batch members must overlap");
    // Results keep lexical order regardless of completion order.
    let names: Vec<String> = run.record.results.iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec!["10-a.sh", "20-b.sh", "30-c.sh", "40-d.sh"]);
}

/// Test: Hard deadline
/// Given a 1s hard deadline and a check that sleeps 5s
/// When the runner executes
/// Then the in-flight check is killed as a timeout and the rest are skipped
#[tokio::test]
async fn test_hard_deadline_cancels_run() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    write_hook(&dir, "10-hang.sh", "sleep 5");
    write_hook(&dir, "20-next.sh", "true");

    let config = HooksConfig {
        hard_deadline_secs: 1,
        ..HooksConfig::default()
    };
    let history = HookHistory::default();
    let started = Instant::now();
    let run = HookRunner::new(&config, &history)
        .run(&HookInvocation::new(&dir, Duration::from_secs(30)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(
        statuses(&run),
        vec![
            ("10-hang.sh".to_string(), HookStatus::Fail(124)),
            ("20-next.sh".to_string(), HookStatus::BudgetSkip),
        ]
    );
}

/// Test: Failures are classified and excerpted
/// Given a check that prints a network error and exits 7
/// When the runner executes
/// Then the result is fail:7, network_error, with the output excerpt
#[tokio::test]
async fn test_failure_classified() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    write_hook(&dir, "10-fetch.sh", "echo 'curl: (7) Connection refused' >&2; exit 7");

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let run = HookRunner::new(&config, &history)
        .run(&HookInvocation::new(&dir, Duration::from_secs(5)))
        .await
        .unwrap();

    let result = &run.record.results[0];
    assert_eq!(result.status, HookStatus::Fail(7));
    assert_eq!(result.failure_category, Some(FailureCategory::NetworkError));
    assert!(result.error_excerpt.contains("Connection refused"));
    assert!(run.log.iter().any(|l| l.contains("hook FAILED: 10-fetch.sh")));
}

/// Test: Category affinity and environment
/// Given an unsuffixed check and one suffixed _E
/// When the runner executes with and without category E
/// Then the suffixed check only runs for E and sees the category variable
#[tokio::test]
async fn test_category_affinity() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    let out = state.path.join("category");
    write_hook(&dir, "10-common.sh", "true");
    write_hook(
        &dir,
        "20-engage_E.sh",
        &format!("printf %s \"$KEEL_HOOK_CATEGORY\" > {}", out.display()),
    );

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let runner = HookRunner::new(&config, &history);

    let plain = runner
        .run(&HookInvocation::new(&dir, Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(plain.record.results.len(), 1);

    let engage = runner
        .run(&HookInvocation {
            category: Some("E".to_string()),
            ..HookInvocation::new(&dir, Duration::from_secs(5))
        })
        .await
        .unwrap();
    assert_eq!(engage.record.results.len(), 2);
    assert_eq!(engage.record.category.as_deref(), Some("E"));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "E");
}

/// Test: Budget is checked before each parallel batch
/// Given four 1s checks in batches of 2 and a 0.5s budget
/// When the runner executes in parallel mode
/// Then the first batch runs and the whole second batch is budget_skip
#[tokio::test]
async fn test_parallel_budget_skips_later_batches() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    let marks = state.path.join("marks");
    std::fs::create_dir_all(&marks).unwrap();
    for name in ["10-a.sh", "20-b.sh", "30-c.sh", "40-d.sh"] {
        write_hook(&dir, name, &format!("sleep 1; touch {}/{}", marks.display(), name));
    }

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let invocation = HookInvocation {
        parallel: Some(2),
        budget: Some(Duration::from_millis(500)),
        ..HookInvocation::new(&dir, Duration::from_secs(10))
    };
    let run = HookRunner::new(&config, &history).run(&invocation).await.unwrap();

    assert_eq!(
        statuses(&run),
        vec![
            ("10-a.sh".to_string(), HookStatus::Ok),
            ("20-b.sh".to_string(), HookStatus::Ok),
            ("30-c.sh".to_string(), HookStatus::BudgetSkip),
            ("40-d.sh".to_string(), HookStatus::BudgetSkip),
        ]
    );
    assert!(marks.join("10-a.sh").exists());
    assert!(marks.join("20-b.sh").exists());
    assert!(!marks.join("30-c.sh").exists(), "Skipped batch must not run");
    assert!(!marks.join("40-d.sh").exists(), "Skipped batch must not run");
}

/// Test: A hook that leaves a background process still completes
/// Given a check that starts `sleep 30 &` and exits 0
/// When the runner executes with a 2s timeout
/// Then the check is ok, not a timeout
#[tokio::test]
async fn test_background_process_does_not_time_out_hook() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    write_hook(&dir, "10-spawn.sh", "sleep 30 &\necho started\nexit 0");

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let started = Instant::now();
    let run = HookRunner::new(&config, &history)
        .run(&HookInvocation::new(&dir, Duration::from_secs(2)))
        .await
        .unwrap();

    let result = &run.record.results[0];
    assert_eq!(result.status, HookStatus::Ok);
    assert_eq!(result.failure_category, None);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

/// Test: A timed-out hook takes its children with it
/// Given a check whose subshell touches a marker after 2s
/// When the check is killed at its 1s timeout
/// Then the marker never appears
#[tokio::test]
async fn test_timeout_kills_hook_children() {
    let state = TestState::new();
    let dir = state.hooks_dir();
    let marker = state.path.join("late-marker");
    write_hook(
        &dir,
        "10-late.sh",
        &format!("sh -c 'sleep 2; touch {}'", marker.display()),
    );

    let config = HooksConfig::default();
    let history = HookHistory::default();
    let run = HookRunner::new(&config, &history)
        .run(&HookInvocation::new(&dir, Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(run.record.results[0].status, HookStatus::Fail(124));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!marker.exists(), "Child of a killed hook kept running");
}
