//! Quality gates for free-text signals.
//!
//! Gates are an ordered list of named rules; the first rule that fires
//! rejects the signal. Order matters: a description that happens to start
//! with a verb-like word is caught as observational before the verb check
//! gets a chance to accept it.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::dedup::DedupEngine;

/// Descriptive prose rather than a task.
static OBSERVATIONAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(enables|mirrors|reflects|spectrum|philosophy|embodies|resembles|illustrates|represents|parallels|echoes|is like|akin to)\b",
    )
    .unwrap()
});

/// Text about the queue rather than the work itself.
static META_INSTRUCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\badd (this|it|that) to the (work )?(queue|backlog)\b|\bqueue (item|this|that)\b|\bshould be (queued|tracked)\b|\bconsider adding\b|\btrack this as\b|\bput (this|it) (in|on) the (queue|backlog)\b)",
    )
    .unwrap()
});

/// Verbs a promotable signal may start with.
const IMPERATIVE_VERBS: &[&str] = &[
    "add", "audit", "automate", "build", "cache", "clean", "convert", "create", "debug",
    "deduplicate", "delete", "deprecate", "detect", "document", "enable", "expose", "extract",
    "fix", "harden", "implement", "improve", "integrate", "investigate", "measure", "merge",
    "migrate", "monitor", "move", "optimize", "port", "profile", "prune", "reduce", "refactor",
    "remove", "rename", "replace", "retry", "rewrite", "ship", "simplify", "split", "support",
    "test", "track", "update", "upgrade", "validate", "wire", "write",
];

/// What a gate rule sees.
pub struct GateInput<'a> {
    pub text: &'a str,
    pub existing: &'a [String],
    pub dedup: &'a DedupEngine,
}

pub struct GateRule {
    pub name: &'static str,
    fires: fn(&GateInput<'_>) -> bool,
}

impl GateRule {
    pub fn fires(&self, input: &GateInput<'_>) -> bool {
        (self.fires)(input)
    }
}

fn starts_with_imperative(text: &str) -> bool {
    let first = text
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    IMPERATIVE_VERBS.contains(&first.as_str())
}

fn observational(input: &GateInput<'_>) -> bool {
    OBSERVATIONAL_RE.is_match(input.text)
}

fn meta_instruction(input: &GateInput<'_>) -> bool {
    META_INSTRUCTION_RE.is_match(input.text)
}

fn not_imperative(input: &GateInput<'_>) -> bool {
    !starts_with_imperative(input.text)
}

fn duplicate(input: &GateInput<'_>) -> bool {
    input
        .dedup
        .is_duplicate(&signal_title(input.text), input.existing.iter().map(String::as_str))
}

pub static GATE_RULES: &[GateRule] = &[
    GateRule { name: "observational_language", fires: observational },
    GateRule { name: "meta_instruction", fires: meta_instruction },
    GateRule { name: "not_imperative", fires: not_imperative },
    GateRule { name: "duplicate", fires: duplicate },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: &'static str,
}

/// Run every rule in order; the first that fires rejects.
pub fn evaluate(input: &GateInput<'_>) -> Result<(), Rejection> {
    match GATE_RULES.iter().find(|rule| rule.fires(input)) {
        Some(rule) => Err(Rejection { rule: rule.name }),
        None => Ok(()),
    }
}

/// Task title for a free-text signal: its first line, minus trailing
/// punctuation, capped at 120 characters.
pub fn signal_title(text: &str) -> String {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let first = first.trim_end_matches(['.', '!', ';', ':']);
    first.chars().take(120).collect()
}
