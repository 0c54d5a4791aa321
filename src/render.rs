use once_cell::sync::Lazy;
use regex::Regex;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::models::{AnswerStats, ReferenceDetail};

// An unterminated block runs to the end of the text.
static THINK_BLOCK: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?is)<think>(.*?)(</think>|$)").ok());

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    /// Collapsible "thought process" block.
    Thought { content: String, in_progress: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReference {
    pub label: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedMessage {
    pub segments: Vec<Segment>,
    pub references: Vec<RenderedReference>,
}

/// Rebuild the displayable form of a message from its full text.
///
/// Called again after every streamed fragment, so a block that was
/// in progress becomes complete once its end marker arrives.
pub fn render_message(text: &str, reference_details: &[ReferenceDetail]) -> RenderedMessage {
    RenderedMessage {
        segments: split_segments(text),
        references: reference_details
            .iter()
            .enumerate()
            .map(|(idx, r)| RenderedReference {
                label: format!("Reference #{} ({})", idx + 1, r.source),
                content: r.content.clone(),
            })
            .collect(),
    }
}

fn split_segments(text: &str) -> Vec<Segment> {
    let re = match THINK_BLOCK.as_ref() {
        Some(re) => re,
        None => return vec![Segment::Text(text.to_string())],
    };

    let mut segments = Vec::new();
    let mut cursor = 0;

    for caps in re.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_text(&mut segments, &text[cursor..whole.start()]);

        let closed = caps.get(2).map(|m| !m.as_str().is_empty()).unwrap_or(false);
        segments.push(Segment::Thought {
            content: inner.as_str().trim().to_string(),
            in_progress: !closed,
        });
        cursor = whole.end();
    }

    push_text(&mut segments, &text[cursor..]);
    segments
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.trim().is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

pub fn stats_line(stats: &AnswerStats) -> String {
    format!(
        "⏱ {}s · in {} · out {}",
        stats.time, stats.prompt_tokens, stats.completion_tokens
    )
}

/// Shorten a sidebar label to `max_width` display columns.
pub fn truncate_title(title: &str, max_width: usize) -> String {
    if title.width() <= max_width {
        return title.to_string();
    }

    let budget = max_width.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for ch in title.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push_str("...");
    out
}
