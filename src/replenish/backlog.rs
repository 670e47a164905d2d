//! Backlog ideas kept as a markdown list.
//!
//! Open ideas are list items `- Title` or `- Title: description` (a bold
//! `**Title**` is accepted). Consumed ideas are struck through and point
//! at the task they became, `- ~~Title~~ -> wq-012`, or at the task they
//! duplicate, `- ~~Title~~ -> dup:wq-007`. Every other line is preserved
//! verbatim when the file is rewritten.

use std::fmt;

use serde::Serialize;

use crate::core::TaskId;

/// An unconsumed idea from the backlog file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklogIdea {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Zero-based line in the backlog file.
    pub line: usize,
}

fn list_item(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .map(str::trim)
}

fn parse_item(item: &str) -> Option<(String, String)> {
    if item.is_empty() || item.starts_with("~~") || item.starts_with("[x]") {
        return None;
    }
    let item = item.strip_prefix("[ ]").map(str::trim).unwrap_or(item);

    if let Some(rest) = item.strip_prefix("**") {
        let end = rest.find("**")?;
        let title = rest[..end].trim().trim_end_matches(':').trim();
        let description = rest[end + 2..].trim().trim_start_matches(':').trim();
        return (!title.is_empty()).then(|| (title.to_string(), description.to_string()));
    }

    let (title, description) = match item.split_once(": ") {
        Some((t, d)) => (t.trim(), d.trim()),
        None => (item, ""),
    };
    (!title.is_empty()).then(|| (title.to_string(), description.to_string()))
}

/// Open ideas in file order (oldest first).
pub fn parse_backlog(markdown: &str) -> Vec<BacklogIdea> {
    markdown
        .lines()
        .enumerate()
        .filter_map(|(line, text)| {
            let item = list_item(text)?;
            let (title, description) = parse_item(item)?;
            Some(BacklogIdea {
                title,
                description,
                line,
            })
        })
        .collect()
}

/// How a backlog idea left the open list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeaMark {
    Promoted(TaskId),
    Duplicate(TaskId),
}

impl fmt::Display for IdeaMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdeaMark::Promoted(id) => write!(f, "{}", id),
            IdeaMark::Duplicate(id) => write!(f, "dup:{}", id),
        }
    }
}

/// Rewrite the given idea lines as consumed.
pub fn mark_consumed(markdown: &str, consumed: &[(usize, IdeaMark)]) -> String {
    let mut out: Vec<String> = markdown.lines().map(str::to_string).collect();
    for (line, mark) in consumed {
        let Some(text) = out.get(*line) else { continue };
        let Some(item) = list_item(text) else { continue };
        let Some((title, _)) = parse_item(item) else { continue };
        let indent: String = text.chars().take_while(|c| c.is_whitespace()).collect();
        out[*line] = format!("{}- ~~{}~~ -> {}", indent, title, mark);
    }
    let mut rendered = out.join("\n");
    if markdown.ends_with('\n') {
        rendered.push('\n');
    }
    rendered
}
