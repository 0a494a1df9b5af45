//! Markdown-compatibility normalization for block content.
//!
//! `normalize` is idempotent: applying it twice gives the same text as once.

/// Normalize model-produced markdown:
///
/// - literal `\n` escapes become newlines, CRLF and lone CR become LF
/// - trailing spaces are trimmed
/// - `•` / `·` bullets become `- ` list items
/// - headings get a blank line before them
/// - runs of blank lines collapse to one, and the ends are trimmed
///
/// Lines inside fenced code blocks keep their bullets and headings.
pub fn normalize(text: &str) -> String {
    let text = text.replace("\\n", "\n").replace("\r\n", "\n").replace('\r', "\n");

    let mut lines: Vec<String> = Vec::new();
    let mut in_fence = false;
    for raw in text.split('\n') {
        let line = raw.trim_end();
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            lines.push(line.to_string());
            continue;
        }
        if in_fence {
            lines.push(line.to_string());
            continue;
        }

        let line = normalize_bullet(line).trim_end().to_string();
        if is_heading(&line) && lines.last().is_some_and(|prev| !prev.is_empty()) {
            lines.push(String::new());
        }
        lines.push(line);
    }

    collapse_newlines(&lines.join("\n")).trim().to_string()
}

fn normalize_bullet(line: &str) -> String {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];
    match body.strip_prefix('•').or_else(|| body.strip_prefix('·')) {
        Some(rest) => format!("{indent}- {}", rest.trim_start()),
        None => line.to_string(),
    }
}

fn is_heading(line: &str) -> bool {
    let body = line.trim_start();
    let hashes = body.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && body[hashes..].starts_with(' ')
}

/// Replace every run of three or more newlines with exactly two.
fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}
