//! Replenishment: turn raw signals into tasks without flooding the queue.
//!
//! Sources are processed in a fixed order within a pass:
//! 1. follow-ups (operator-declared, dedup only, always drained);
//! 2. friction detected from metrics and hook history (dedup only);
//! 3. observations (every quality gate, at most `observation_cap`
//!    promotions; unprocessed entries wait for the next pass);
//! 4. backlog ideas, throttled by the dynamic buffer.
//!
//! Every processed entry is consumed in the same pass: promoted and
//! duplicate ideas are struck through in the backlog, drained signals are
//! removed from their file, rejected observations go to the rejected log.
//! One-shot signals are deduplicated against archived tasks as well as
//! live ones; friction is recomputed every pass and only checks the live
//! queue.

mod backlog;
mod gates;
mod signals;

pub use backlog::{mark_consumed, parse_backlog, BacklogIdea, IdeaMark};
pub use gates::{evaluate, signal_title, GateInput, GateRule, Rejection, GATE_RULES};
pub use signals::{detect_friction, FrictionData, RejectedSignal, SignalEntry};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{QueueConfig, ReplenishConfig};
use crate::core::{NewTask, TaskId, TaskQueue};
use crate::dedup::DedupEngine;
use crate::hooks::HookHistory;
use crate::store::{RecordSet, StateStore};
use crate::{klog, klog_debug, Result};

/// Rejected observations kept for review.
const REJECTED_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Followup,
    Friction,
    Observation,
    Backlog,
}

impl SignalSource {
    pub fn tag(self) -> &'static str {
        match self {
            SignalSource::Followup => "followup",
            SignalSource::Friction => "friction",
            SignalSource::Observation => "observation",
            SignalSource::Backlog => "backlog",
        }
    }

    fn priority(self) -> i64 {
        match self {
            SignalSource::Followup => 3,
            SignalSource::Friction => 4,
            SignalSource::Backlog => 5,
            SignalSource::Observation => 6,
        }
    }
}

/// Number of backlog ideas to promote.
///
/// With deficit `d = floor - pending`, `max(1, floor - d)` ideas are held
/// back as a buffer and at most `d` promoted: aggressive when the queue is
/// empty, conservative as it nears the floor, nothing at or above it.
pub fn promotion_count(pending: usize, floor: usize, available: usize) -> usize {
    if pending >= floor {
        return 0;
    }
    let deficit = floor - pending;
    let buffer = (floor - deficit).max(1);
    deficit.min(available.saturating_sub(buffer))
}

/// Everything the pipeline reads in one pass.
#[derive(Debug, Clone, Default)]
pub struct SignalSources {
    pub backlog: Option<String>,
    pub followups: Vec<SignalEntry>,
    pub observations: Vec<SignalEntry>,
    pub friction: FrictionData,
}

impl SignalSources {
    /// Read every source leniently: unreadable means empty.
    pub fn load(store: &mut StateStore) -> Self {
        let backlog_path = store.path(RecordSet::Backlog);
        let backlog = store.read_text_at(&backlog_path).unwrap_or_else(|e| {
            klog_debug!("Skipping unreadable backlog: {}", e);
            None
        });
        Self {
            backlog,
            followups: store.load_json_lenient(RecordSet::Followups),
            observations: store.load_json_lenient(RecordSet::Observations),
            friction: store.load_json_lenient(RecordSet::Friction),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub id: TaskId,
    pub title: String,
    pub source: SignalSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateRejection {
    pub text: String,
    pub rule: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplenishReport {
    pub promoted: Vec<Promotion>,
    pub rejected: Vec<GateRejection>,
    pub duplicates: usize,
}

/// Source files to rewrite once the queue is saved.
#[derive(Debug, Clone, Default)]
pub struct ConsumedSignals {
    pub backlog: Option<String>,
    pub followups: Option<Vec<SignalEntry>>,
    pub observations: Option<Vec<SignalEntry>>,
    pub rejected: Vec<RejectedSignal>,
}

impl ConsumedSignals {
    pub fn is_empty(&self) -> bool {
        self.backlog.is_none()
            && self.followups.is_none()
            && self.observations.is_none()
            && self.rejected.is_empty()
    }

    pub fn persist(&self, store: &mut StateStore) -> Result<()> {
        if let Some(text) = &self.backlog {
            let path = store.path(RecordSet::Backlog);
            store.write_text_at(&path, text)?;
        }
        if let Some(followups) = &self.followups {
            store.write_json(RecordSet::Followups, followups)?;
        }
        if let Some(observations) = &self.observations {
            store.write_json(RecordSet::Observations, observations)?;
        }
        if !self.rejected.is_empty() {
            let mut log: Vec<RejectedSignal> = store.load_json_lenient(RecordSet::RejectedObservations);
            log.extend(self.rejected.iter().cloned());
            if log.len() > REJECTED_LOG_LIMIT {
                log.drain(..log.len() - REJECTED_LOG_LIMIT);
            }
            store.write_json(RecordSet::RejectedObservations, &log)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplenishOutcome {
    pub report: ReplenishReport,
    pub consumed: ConsumedSignals,
}

pub struct Replenisher<'a> {
    config: &'a ReplenishConfig,
    queue_config: &'a QueueConfig,
    dedup: &'a DedupEngine,
}

impl<'a> Replenisher<'a> {
    pub fn new(
        config: &'a ReplenishConfig,
        queue_config: &'a QueueConfig,
        dedup: &'a DedupEngine,
    ) -> Self {
        Self {
            config,
            queue_config,
            dedup,
        }
    }

    fn promote(
        &self,
        queue: &mut TaskQueue,
        title: &str,
        description: &str,
        origin: &str,
        source: SignalSource,
        now: DateTime<Utc>,
    ) -> Result<Promotion> {
        let mut new = NewTask::titled(title, source.tag())
            .with_tag(source.tag())
            .with_description(description);
        new.priority = source.priority();
        let id = queue.add(new, now)?;
        if !origin.is_empty() {
            queue.add_note(id, "origin", origin)?;
        }
        klog!("Promoted {} {} ({})", source.tag(), id, title);
        Ok(Promotion {
            id,
            title: title.to_string(),
            source,
        })
    }

    fn is_queued(&self, queue: &TaskQueue, title: &str) -> bool {
        let titles = queue.titles();
        self.dedup.is_duplicate(title, titles.iter().map(String::as_str))
    }

    /// The live or archived task `title` duplicates.
    fn known_match(&self, queue: &TaskQueue, title: &str) -> Option<TaskId> {
        queue
            .queue
            .iter()
            .chain(queue.archive.iter())
            .find(|task| self.dedup.is_near_duplicate(title, &task.title))
            .map(|task| task.id)
    }

    pub fn run(
        &self,
        queue: &mut TaskQueue,
        sources: &SignalSources,
        history: &HookHistory,
        now: DateTime<Utc>,
    ) -> Result<ReplenishOutcome> {
        let mut out = ReplenishOutcome::default();

        // Follow-ups: dedup only, always drained.
        for entry in &sources.followups {
            let title = signal_title(entry.action_text());
            if title.is_empty() {
                continue;
            }
            if self.known_match(queue, &title).is_some() {
                out.report.duplicates += 1;
                continue;
            }
            let description = if entry.text.trim() != title { entry.text.as_str() } else { "" };
            out.report.promoted.push(self.promote(
                queue,
                &title,
                description,
                &entry.origin,
                SignalSource::Followup,
                now,
            )?);
        }
        if !sources.followups.is_empty() {
            out.consumed.followups = Some(Vec::new());
        }

        // Friction: recomputed from metrics every pass, dedup only.
        for title in detect_friction(&sources.friction, history, self.config) {
            if self.is_queued(queue, &title) {
                out.report.duplicates += 1;
                continue;
            }
            out.report.promoted.push(self.promote(
                queue,
                &title,
                "Detected from usage metrics",
                "",
                SignalSource::Friction,
                now,
            )?);
        }

        // Observations: every gate, capped per pass.
        let mut promoted_observations = 0;
        let mut processed = 0;
        for entry in &sources.observations {
            if promoted_observations >= self.config.observation_cap {
                break;
            }
            processed += 1;
            let text = entry.action_text();
            let existing = queue.known_titles();
            let verdict = evaluate(&GateInput {
                text,
                existing: &existing,
                dedup: self.dedup,
            });
            match verdict {
                Ok(()) => {
                    let title = signal_title(text);
                    let description = if entry.text.trim() != title { entry.text.as_str() } else { "" };
                    out.report.promoted.push(self.promote(
                        queue,
                        &title,
                        description,
                        &entry.origin,
                        SignalSource::Observation,
                        now,
                    )?);
                    promoted_observations += 1;
                }
                Err(rejection) => {
                    klog_debug!("Observation rejected by {}: {:?}", rejection.rule, text);
                    out.report.rejected.push(GateRejection {
                        text: text.to_string(),
                        rule: rejection.rule,
                    });
                    out.consumed.rejected.push(RejectedSignal {
                        entry: entry.clone(),
                        rule: rejection.rule.to_string(),
                        rejected_at: now,
                    });
                }
            }
        }
        if processed > 0 {
            out.consumed.observations = Some(sources.observations[processed..].to_vec());
        }

        // Backlog: dynamic buffer over ideas not already known.
        if let Some(markdown) = &sources.backlog {
            let ideas = parse_backlog(markdown);
            let mut eligible: Vec<&BacklogIdea> = Vec::new();
            let mut repeats: Vec<(usize, usize)> = Vec::new();
            let mut marks: Vec<(usize, IdeaMark)> = Vec::new();
            for idea in &ideas {
                let earlier = eligible
                    .iter()
                    .position(|e| self.dedup.is_near_duplicate(&idea.title, &e.title));
                if let Some(earlier) = earlier {
                    out.report.duplicates += 1;
                    repeats.push((idea.line, earlier));
                    continue;
                }
                if let Some(existing) = self.known_match(queue, &idea.title) {
                    klog_debug!("Backlog idea {:?} duplicates {}", idea.title, existing);
                    out.report.duplicates += 1;
                    marks.push((idea.line, IdeaMark::Duplicate(existing)));
                    continue;
                }
                eligible.push(idea);
            }

            let count = promotion_count(
                queue.pending_count(),
                self.queue_config.pending_floor,
                eligible.len(),
            );
            klog_debug!(
                "Backlog: {} eligible ideas, {} pending, promoting {}",
                eligible.len(),
                queue.pending_count(),
                count
            );
            let mut promoted_ids: Vec<TaskId> = Vec::new();
            for idea in eligible.iter().take(count) {
                let promotion = self.promote(
                    queue,
                    &idea.title,
                    &idea.description,
                    "",
                    SignalSource::Backlog,
                    now,
                )?;
                marks.push((idea.line, IdeaMark::Promoted(promotion.id)));
                promoted_ids.push(promotion.id);
                out.report.promoted.push(promotion);
            }
            // Repeats of an idea still open wait behind it.
            for (line, earlier) in repeats {
                if let Some(id) = promoted_ids.get(earlier) {
                    marks.push((line, IdeaMark::Duplicate(*id)));
                }
            }
            if !marks.is_empty() {
                out.consumed.backlog = Some(mark_consumed(markdown, &marks));
            }
        }

        Ok(out)
    }
}
