//! Structured block parsing for subagent output.
//!
//! A block is `<tagN>…</tagM>` where `tag` is the subagent's slug and `N`,
//! `M` are decimal integers (they need not agree). The model's numbering is
//! kept only as `model_id`; callers reallocate ids per session.

use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashSet;

use crate::tags::{collapse_whitespace, strip_matches};

/// Longest first line accepted as a fallback title, in characters.
const FALLBACK_TITLE_MAX_CHARS: usize = 100;

/// How a subagent's blocks are shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConfig {
    pub tag: String,
    pub title_tag: String,
    pub cover_text_tag: Option<String>,
    pub hook_tag: Option<String>,
}

impl BlockConfig {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            title_tag: "title".into(),
            cover_text_tag: None,
            hook_tag: None,
        }
    }

    pub fn with_cover_text(mut self) -> Self {
        self.cover_text_tag = Some("cover_text".into());
        self
    }

    pub fn with_hook(mut self) -> Self {
        self.hook_tag = Some("hook".into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedBlock {
    /// The id as the model wrote it, e.g. `knowledge7`.
    pub model_id: String,
    pub title: Option<String>,
    pub content: String,
    pub cover_text: Option<String>,
    pub hook: Option<String>,
}

/// Streaming parser for one subagent's blocks.
pub struct BlockParser {
    config: BlockConfig,
    block: Regex,
    title: Regex,
    cover_text: Option<Regex>,
    hook: Option<Regex>,
    buffer: String,
    /// Byte offset past the last completed block; earlier text is never
    /// scanned again.
    scan_from: usize,
    processed: HashSet<String>,
    blocks: Vec<ParsedBlock>,
}

fn child_regex(tag: &str) -> Option<Regex> {
    let tag = regex_lite::escape(tag);
    Regex::new(&format!(r"<{tag}>([\s\S]*?)</{tag}>")).ok()
}

impl BlockParser {
    /// Returns `None` only when the configured tag cannot form a pattern,
    /// which escaping rules out.
    pub fn new(config: BlockConfig) -> Option<Self> {
        let tag = regex_lite::escape(&config.tag);
        let block = Regex::new(&format!(r"<{tag}(\d+)>([\s\S]*?)</{tag}\d+>")).ok()?;
        let title = child_regex(&config.title_tag)?;
        let cover_text = match &config.cover_text_tag {
            Some(t) => Some(child_regex(t)?),
            None => None,
        };
        let hook = match &config.hook_tag {
            Some(t) => Some(child_regex(t)?),
            None => None,
        };
        Some(Self {
            config,
            block,
            title,
            cover_text,
            hook,
            buffer: String::new(),
            scan_from: 0,
            processed: HashSet::new(),
            blocks: Vec::new(),
        })
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
        self.processed.clear();
        self.blocks.clear();
    }

    /// Append a chunk and return blocks completed by it.
    pub fn add_chunk(&mut self, chunk: &str) -> Vec<ParsedBlock> {
        self.buffer.push_str(chunk);
        // Every block ends in `>`, so a chunk without one completes nothing.
        if !chunk.contains('>') {
            return Vec::new();
        }

        let mut found = Vec::new();
        let start = self.scan_from;
        for caps in self.block.captures_iter(&self.buffer[start..]) {
            if let Some(whole) = caps.get(0) {
                self.scan_from = start + whole.end();
            }
            let number = caps.get(1).map_or("", |m| m.as_str());
            let body = caps.get(2).map_or("", |m| m.as_str());
            let key = format!("{}:{}", self.config.tag, body.trim());
            if !self.processed.insert(key) {
                continue;
            }
            found.push(self.parse_body(&format!("{}{number}", self.config.tag), body));
        }
        self.blocks.extend(found.iter().cloned());
        found
    }

    /// Every block completed so far, in completion order.
    pub fn blocks(&self) -> &[ParsedBlock] {
        &self.blocks
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Text outside the blocks, whitespace collapsed.
    pub fn other_content(&self) -> String {
        collapse_whitespace(&strip_matches(&self.buffer, &[&self.block]))
    }

    /// Parse a complete text in one pass.
    pub fn parse_all(config: BlockConfig, text: &str) -> Vec<ParsedBlock> {
        match Self::new(config) {
            Some(mut parser) => parser.add_chunk(text),
            None => Vec::new(),
        }
    }

    fn parse_body(&self, model_id: &str, body: &str) -> ParsedBlock {
        let mut content = body.to_string();

        let title = match self.title.captures(body) {
            Some(caps) => {
                if let Some(whole) = caps.get(0) {
                    content = content.replacen(whole.as_str(), "", 1);
                }
                caps.get(1).map(|m| m.as_str().trim().to_string()).filter(|t| !t.is_empty())
            }
            None => fallback_title(body),
        };

        let cover_text = self.cover_text.as_ref().and_then(|re| take_child(re, &mut content));
        let hook = self.hook.as_ref().and_then(|re| take_child(re, &mut content));

        ParsedBlock {
            model_id: model_id.to_string(),
            title,
            content: collapse_blank_lines(&content),
            cover_text,
            hook,
        }
    }
}

/// Extract a child tag's trimmed text and remove its span from `content`.
fn take_child(re: &Regex, content: &mut String) -> Option<String> {
    let (whole, inner) = {
        let caps = re.captures(content)?;
        let whole = caps.get(0)?.as_str().to_string();
        let inner = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
        (whole, inner)
    };
    *content = content.replacen(&whole, "", 1);
    Some(inner).filter(|s| !s.is_empty())
}

/// First non-empty line, if short and not a `key: value` line.
fn fallback_title(body: &str) -> Option<String> {
    let line = body.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= FALLBACK_TITLE_MAX_CHARS && !line.contains(':') && !line.contains('：') {
        Some(line.to_string())
    } else {
        None
    }
}

/// Trim trailing spaces, collapse runs of blank lines to one, trim the ends.
pub fn collapse_blank_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in text.lines().map(str::trim_end) {
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push(line);
        previous_blank = blank;
    }
    out.join("\n").trim().to_string()
}
