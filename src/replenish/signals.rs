//! Raw signal sources: follow-ups, observations and friction metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReplenishConfig;
use crate::hooks::HookHistory;

/// Runs the failing-hook detector looks back over.
const FAILING_HOOK_RUNS: usize = 5;

/// A candidate for promotion, as written by collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalEntry {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<String>,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SignalEntry {
    pub fn new(text: &str, origin: &str) -> Self {
        Self {
            text: text.to_string(),
            origin: origin.to_string(),
            ..Default::default()
        }
    }

    /// The text to judge and title the task by.
    pub fn action_text(&self) -> &str {
        match self.proposed_action.as_deref().map(str::trim) {
            Some(action) if !action.is_empty() => action,
            _ => self.text.trim(),
        }
    }
}

/// A signal the quality gates turned away, kept for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSignal {
    #[serde(flatten)]
    pub entry: SignalEntry,
    pub rule: String,
    pub rejected_at: DateTime<Utc>,
}

/// Collaborator-written usage metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrictionData {
    /// Edit count per resource.
    pub touches: BTreeMap<String, u32>,
    /// Score series per category, oldest first.
    pub trends: BTreeMap<String, Vec<f64>>,
}

fn strictly_decreasing(values: &[f64], window: usize) -> bool {
    if window < 2 || values.len() < window {
        return false;
    }
    values[values.len() - window..].windows(2).all(|w| w[1] < w[0])
}

/// Task titles for detected friction, in a stable order.
pub fn detect_friction(
    data: &FrictionData,
    history: &HookHistory,
    config: &ReplenishConfig,
) -> Vec<String> {
    let mut titles: Vec<String> = data
        .touches
        .iter()
        .filter(|(_, count)| **count >= config.friction_touch_threshold)
        .map(|(resource, count)| {
            format!("Refactor {} to reduce churn ({} touches)", resource, count)
        })
        .collect();

    titles.extend(
        data.trends
            .iter()
            .filter(|(_, values)| strictly_decreasing(values, config.friction_trend_window))
            .map(|(category, _)| format!("Investigate declining {} trend", category)),
    );

    titles.extend(
        history
            .recent_failure_counts(FAILING_HOOK_RUNS)
            .into_iter()
            .filter(|(_, fails)| *fails >= config.failing_hook_threshold)
            .map(|(name, _)| format!("Fix failing hook {}", name)),
    );
    titles
}
