//! Streaming parser for XML-like tags in a growing model response.
//!
//! Chunks are appended to an internal buffer; each call reports only tags
//! that became complete since the last call. A tag is reported at most once
//! per parser lifetime, keyed by its name and trimmed inner text, so the
//! same completed tag fed twice yields one entry.
//!
//! Partial tags stay buffered until their closing tag arrives. Nesting is
//! not interpreted.

use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashSet;

/// Tags the orchestrator narrates its reasoning in.
pub const ORCHESTRATOR_TAGS: [&str; 3] = ["think", "Observe", "observe"];

/// One completed tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TagInfo {
    pub tag: String,
    /// Trimmed inner text.
    pub content: String,
}

struct TagPattern {
    name: String,
    complete: Regex,
    open: Regex,
    /// Byte offset past the last completed match of this tag.
    scan_from: usize,
}

impl TagPattern {
    fn new(name: &str) -> Option<Self> {
        let escaped = regex_lite::escape(name);
        let complete = Regex::new(&format!(r"<{escaped}(?:\s[^>]*)?>([\s\S]*?)</{escaped}>")).ok()?;
        let open = Regex::new(&format!(r"<{escaped}(?:\s[^>]*)?>")).ok()?;
        Some(Self {
            name: name.to_string(),
            complete,
            open,
            scan_from: 0,
        })
    }
}

pub struct StreamingTagParser {
    patterns: Vec<TagPattern>,
    buffer: String,
    processed: HashSet<String>,
}

impl StreamingTagParser {
    pub fn new(tags: &[&str]) -> Self {
        Self {
            patterns: tags.iter().filter_map(|t| TagPattern::new(t)).collect(),
            buffer: String::new(),
            processed: HashSet::new(),
        }
    }

    /// Parser for the orchestrator's `think` / `Observe` / `observe` tags.
    pub fn for_orchestrator() -> Self {
        Self::new(&ORCHESTRATOR_TAGS)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.processed.clear();
        for pattern in &mut self.patterns {
            pattern.scan_from = 0;
        }
    }

    /// Append a chunk and return tags completed by it.
    pub fn add_chunk(&mut self, chunk: &str) -> Vec<TagInfo> {
        self.buffer.push_str(chunk);
        if !chunk.contains('>') {
            return Vec::new();
        }

        let mut found = Vec::new();
        for pattern in &mut self.patterns {
            let start = pattern.scan_from;
            for caps in pattern.complete.captures_iter(&self.buffer[start..]) {
                if let Some(whole) = caps.get(0) {
                    pattern.scan_from = start + whole.end();
                }
                let content = caps.get(1).map_or("", |m| m.as_str()).trim();
                let key = format!("{}:{}", pattern.name, content);
                if self.processed.insert(key) {
                    found.push(TagInfo {
                        tag: pattern.name.clone(),
                        content: content.to_string(),
                    });
                }
            }
        }
        found
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The buffer with every completed tag removed and whitespace collapsed:
    /// the narration outside tags.
    pub fn unprocessed_content(&self) -> String {
        let regexes: Vec<&Regex> = self.patterns.iter().map(|p| &p.complete).collect();
        collapse_whitespace(&strip_matches(&self.buffer, &regexes))
    }

    /// Whether every opened `tag` in the buffer has been closed.
    pub fn is_tag_complete(&self, tag: &str) -> bool {
        let Some(pattern) = self.patterns.iter().find(|p| p.name == tag) else {
            return true;
        };
        let opens = pattern.open.find_iter(&self.buffer).count();
        let closes = self.buffer.matches(&format!("</{tag}>")).count();
        opens == closes
    }
}

/// Remove every match of every regex, applied in order.
pub(crate) fn strip_matches(text: &str, regexes: &[&Regex]) -> String {
    let mut out = text.to_string();
    for re in regexes {
        out = re.replace_all(&out, "").into_owned();
    }
    out
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
