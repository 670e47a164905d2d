//! Near-duplicate detection for task titles.
//!
//! Two heuristic stages, tuned to miss duplicates rather than block new
//! work:
//! - **Prefix containment**: the first `prefix_len` normalized characters
//!   of either title appear inside the other. Only titles at least that
//!   long take part, so short titles cannot match everything.
//! - **Keyword overlap**: words of `min_keyword_len`+ characters, minus
//!   stop words; a duplicate when at least `overlap_ratio` of the smaller
//!   set is contained in the larger. The smaller set needs two keywords.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

use crate::config::DedupConfig;
use crate::core::{TaskId, TaskQueue, TaskStatus};
use crate::klog;

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "before", "been", "each", "from", "have", "into", "just",
    "more", "only", "over", "should", "some", "than", "that", "them", "then", "there",
    "these", "they", "this", "under", "using", "what", "when", "which", "will", "with",
    "would", "your", "make", "ensure", "implement", "build", "create",
];

/// Lowercase, turn punctuation into spaces and collapse whitespace.
pub fn normalize(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for c in title.chars().filter(|c| *c != '\'') {
        if c.is_alphanumeric() || c.is_whitespace() {
            cleaned.extend(c.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Significant words of a normalized title.
pub fn keywords(normalized: &str, min_len: usize) -> HashSet<String> {
    normalized
        .split(' ')
        .filter(|w| w.chars().count() >= min_len)
        .filter(|w| !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Stateless matcher holding the tuned thresholds.
#[derive(Debug, Clone)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    fn prefix_match(&self, a: &str, b: &str) -> bool {
        let len = self.config.prefix_len;
        let contains_prefix = |x: &str, y: &str| {
            if x.chars().count() < len {
                return false;
            }
            let prefix: String = x.chars().take(len).collect();
            y.contains(prefix.as_str())
        };
        contains_prefix(a, b) || contains_prefix(b, a)
    }

    fn keyword_match(&self, a: &str, b: &str) -> bool {
        let ka = keywords(a, self.config.min_keyword_len);
        let kb = keywords(b, self.config.min_keyword_len);
        let (smaller, larger) = if ka.len() <= kb.len() { (ka, kb) } else { (kb, ka) };
        if smaller.len() < 2 {
            return false;
        }
        let shared = smaller.iter().filter(|w| larger.contains(*w)).count();
        shared as f64 >= self.config.overlap_ratio * smaller.len() as f64
    }

    /// True when two titles look like the same piece of work.
    pub fn is_near_duplicate(&self, a: &str, b: &str) -> bool {
        let na = normalize(a);
        let nb = normalize(b);
        if na.is_empty() || nb.is_empty() {
            return false;
        }
        na == nb || self.prefix_match(&na, &nb) || self.keyword_match(&na, &nb)
    }

    /// The first existing title `candidate` duplicates, if any.
    pub fn find_duplicate<'a, I>(&self, candidate: &str, existing: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        existing
            .into_iter()
            .find(|title| self.is_near_duplicate(candidate, title))
    }

    pub fn is_duplicate<'a, I>(&self, candidate: &str, existing: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.find_duplicate(candidate, existing).is_some()
    }
}

/// A pending task archived as a duplicate of an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupRemoval {
    pub removed: TaskId,
    pub kept: TaskId,
    pub title: String,
}

/// Retire and archive pending tasks that duplicate an earlier pending task.
///
/// Later entries lose to earlier ones, and each candidate is compared only
/// against tasks that survived, so a second run finds nothing to remove.
pub fn self_dedup(
    engine: &DedupEngine,
    queue: &mut TaskQueue,
    now: DateTime<Utc>,
) -> Vec<DedupRemoval> {
    let mut kept: Vec<(TaskId, String)> = Vec::new();
    let mut removals = Vec::new();

    for task in queue.queue.iter().filter(|t| t.status == TaskStatus::Pending) {
        let survivor = kept
            .iter()
            .find(|(_, title)| engine.is_near_duplicate(&task.title, title))
            .map(|(id, _)| *id);
        match survivor {
            Some(kept_id) => removals.push(DedupRemoval {
                removed: task.id,
                kept: kept_id,
                title: task.title.clone(),
            }),
            None => kept.push((task.id, task.title.clone())),
        }
    }

    for removal in &removals {
        if let Some(task) = queue.get_mut(removal.removed) {
            task.add_note("dedup", &format!("duplicate of {}", removal.kept));
            task.close(TaskStatus::Retired, now);
        }
        queue.archive_task(removal.removed);
        klog!(
            "Self-dedup removed {} ({:?}) as duplicate of {}",
            removal.removed,
            removal.title,
            removal.kept
        );
    }
    removals
}
