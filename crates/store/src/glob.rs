//! Redis-style glob matching for `SCAN MATCH` patterns.
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes.

/// Whether `key` matches `pattern`.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    match_from(&p, &k)
}

/// Escape `text` so it matches only itself inside a pattern.
pub fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn match_from(p: &[char], k: &[char]) -> bool {
    let (mut pi, mut ki) = (0usize, 0usize);
    // Backtrack point for the most recent `*`
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ki));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, k[ki]) {
                        if matched {
                            pi = next;
                            ki += 1;
                            continue;
                        }
                    } else if k[ki] == '[' {
                        // Unterminated class is a literal bracket
                        pi += 1;
                        ki += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == k[ki] {
                        pi += 2;
                        ki += 1;
                        continue;
                    }
                }
                c => {
                    if c == k[ki] {
                        pi += 1;
                        ki += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((sp, sk)) => {
                pi = sp + 1;
                ki = sk + 1;
                star = Some((sp, sk + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Evaluate a `[...]` class starting at `p[start]`. Returns whether `c`
/// matched and the index just past the closing bracket, or `None` when the
/// class is unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
