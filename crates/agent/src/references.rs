//! Natural-language references to session artifacts.
//!
//! Turns phrases like "第三个洞察", "洞察2", "最新的" or "@file1" into
//! canonical `@<type><n>` tokens, resolved against the session's created
//! notes. File references pass through untouched; every other token must name
//! something the session knows about.

use loomi_session::ContextState;
use regex_lite::Regex;
use std::sync::LazyLock;

/// Content-type keywords and the reference type they stand for.
pub const LEXICON: [(&str, &str); 10] = [
    ("洞察", "insight"),
    ("画像", "profile"),
    ("打点", "hitpoint"),
    ("事实", "facts"),
    ("帖子", "xhs_post"),
    ("抖音", "tiktok_script"),
    ("小红书", "xhs_post"),
    ("微信", "wechat_article"),
    ("文章", "wechat_article"),
    ("思考", "fake_think"),
];

/// Reference types that name uploaded files rather than notes.
pub const FILE_TYPES: [&str; 6] = ["file", "image", "document", "pdf", "word", "excel"];

const KEYWORDS: &str = "洞察|画像|打点|事实|帖子|抖音|小红书|微信|文章|思考";
const TYPE_NAMES: &str = "insight|profile|hitpoint|facts|xhs_post|tiktok_script|wechat_article|fake_think";

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        concat!(
            r"(?P<std>@[A-Za-z][A-Za-z_]*\d+)",
            r"|第?(?P<ord>[一二三四五六七八九十]|\d+)个?的?(?P<ord_kw>{kw})",
            r"|(?P<rev_kw>{kw}|{types})(?P<rev>\d+)",
            r"|(?P<rel>最新|最后|上一个|最近)(?:的|个)?(?P<rel_kw>{kw})?",
            r"|(?P<kw>{kw})",
        ),
        kw = KEYWORDS,
        types = TYPE_NAMES,
    );
    Regex::new(&pattern).expect("reference pattern is valid")
});

static CANONICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@([A-Za-z][A-Za-z_]*?)(\d+)$").expect("canonical pattern is valid"));

/// Position counted back from the newest note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recency {
    Latest,
    Previous,
    Recent,
}

impl Recency {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "最新" | "最后" => Some(Self::Latest),
            "上一个" => Some(Self::Previous),
            "最近" => Some(Self::Recent),
            _ => None,
        }
    }

    fn offset_from_end(self) -> usize {
        match self {
            Self::Latest => 1,
            Self::Previous => 2,
            Self::Recent => 3,
        }
    }
}

fn type_for(word: &str) -> Option<&'static str> {
    LEXICON
        .iter()
        .find(|(kw, _)| *kw == word)
        .map(|(_, t)| *t)
        .or_else(|| TYPE_NAMES.split('|').find(|t| *t == word))
}

fn parse_ordinal(text: &str) -> Option<u64> {
    let numeral = match text {
        "一" => 1,
        "二" => 2,
        "三" => 3,
        "四" => 4,
        "五" => 5,
        "六" => 6,
        "七" => 7,
        "八" => 8,
        "九" => 9,
        "十" => 10,
        _ => return text.parse().ok().filter(|n| *n > 0),
    };
    Some(numeral)
}

fn is_file_reference(token: &str) -> bool {
    CANONICAL
        .captures(token)
        .and_then(|caps| caps.get(1))
        .is_some_and(|t| FILE_TYPES.contains(&t.as_str()))
}

/// Note ids of `kind` (`insight3` style), oldest first. `None` means any type.
fn ids_of<'a>(state: &'a ContextState, kind: Option<&'a str>) -> impl Iterator<Item = &'a str> + 'a {
    state.created_notes.iter().map(|n| n.id.as_str()).filter(move |id| match kind {
        None => true,
        Some(kind) => id
            .strip_prefix(kind)
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())),
    })
}

fn nth_from_end(state: &ContextState, kind: Option<&str>, recency: Recency) -> Option<String> {
    let ids: Vec<&str> = ids_of(state, kind).collect();
    let index = ids.len().checked_sub(recency.offset_from_end())?;
    Some(format!("@{}", ids[index]))
}

fn is_known(state: &ContextState, token: &str) -> bool {
    let bare = token.trim_start_matches('@');
    state.knows_reference(bare) || state.knows_reference(token)
}

/// Resolve every reference in `input`, in the order they appear, without
/// duplicates.
pub fn resolve_references(input: &str, state: &ContextState) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();

    for caps in REFERENCE.captures_iter(input) {
        let candidate = if let Some(m) = caps.name("std") {
            Some(m.as_str().to_string())
        } else if let (Some(n), Some(kw)) = (caps.name("ord"), caps.name("ord_kw")) {
            match (parse_ordinal(n.as_str()), type_for(kw.as_str())) {
                (Some(n), Some(kind)) => Some(format!("@{kind}{n}")),
                _ => None,
            }
        } else if let (Some(kw), Some(n)) = (caps.name("rev_kw"), caps.name("rev")) {
            match (type_for(kw.as_str()), n.as_str().parse::<u64>()) {
                (Some(kind), Ok(n)) => Some(format!("@{kind}{n}")),
                _ => None,
            }
        } else if let Some(rel) = caps.name("rel") {
            let kind = caps.name("rel_kw").and_then(|kw| type_for(kw.as_str()));
            Recency::parse(rel.as_str()).and_then(|recency| nth_from_end(state, kind, recency))
        } else if let Some(kw) = caps.name("kw") {
            type_for(kw.as_str()).and_then(|kind| nth_from_end(state, Some(kind), Recency::Latest))
        } else {
            None
        };

        let Some(token) = candidate else { continue };
        if !is_file_reference(&token) && !is_known(state, &token) {
            continue;
        }
        if !resolved.contains(&token) {
            resolved.push(token);
        }
    }

    resolved
}
