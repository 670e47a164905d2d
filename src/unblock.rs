//! Auto-unblock: promote blocked tasks whose blocker check now passes.
//!
//! Runs on every pass regardless of consumer type. Each check is a shell
//! predicate with a short timeout; exit code 0 moves the task back to
//! pending and clears the predicate. Checks run concurrently.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskId, TaskQueue, TaskStatus};
use crate::process::{self, ProcessSpec};
use crate::{klog, klog_debug, klog_warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnblockReport {
    pub promoted: Vec<TaskId>,
    pub still_blocked: Vec<TaskId>,
}

pub async fn auto_unblock(
    queue: &mut TaskQueue,
    timeout: Duration,
    cancel: &CancellationToken,
) -> UnblockReport {
    let checks: Vec<(TaskId, String)> = queue
        .queue
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .filter_map(|t| t.blocker_check.clone().map(|c| (t.id, c)))
        .collect();

    let runs = checks.into_iter().map(|(id, command)| async move {
        let spec = match ProcessSpec::shell(&command, timeout) {
            Ok(spec) => spec,
            Err(e) => {
                klog_warn!("Blocker check for {} not runnable: {}", id, e);
                return (id, false);
            }
        };
        let out = process::run(&spec, cancel).await;
        klog_debug!("Blocker check {} for {} exited {}", command, id, out.exit_code);
        (id, out.success())
    });

    let mut report = UnblockReport::default();
    for (id, cleared) in join_all(runs).await {
        if !cleared {
            report.still_blocked.push(id);
            continue;
        }
        if let Some(task) = queue.get_mut(id) {
            task.status = TaskStatus::Pending;
            task.blocker_check = None;
            task.add_note("unblock", "blocker check passed");
            klog!("Auto-unblocked {} ({})", id, task.title);
            report.promoted.push(id);
        }
    }
    report
}
