//! Orchestrator decision parsing: `<Action type="slug">instruction</Action>`.

use loomi_core::action::ActionKind;
use loomi_core::request::ActionItem;
use regex_lite::Regex;
use std::sync::LazyLock;
use tracing::debug;

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<Action type="([a-zA-Z0-9_\-]+)">(.*?)</Action>"#)
        .expect("action pattern is a valid regex")
});

/// Actions found in a decision response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedActions {
    /// Known actions in response order.
    pub items: Vec<ActionItem>,
    /// Slugs that matched the syntax but name no subagent.
    pub unknown: Vec<String>,
}

impl ParsedActions {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn parse_actions(response: &str) -> ParsedActions {
    let mut parsed = ParsedActions::default();
    for caps in ACTION_RE.captures_iter(response) {
        let slug = caps.get(1).map_or("", |m| m.as_str());
        let instruction = caps.get(2).map_or("", |m| m.as_str()).trim();
        match ActionKind::from_slug(slug) {
            Some(action_type) => parsed.items.push(ActionItem {
                action_type,
                instruction: instruction.to_string(),
            }),
            None => {
                debug!(slug, "Dropping unknown action type");
                parsed.unknown.push(slug.to_string());
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_actions_in_order() {
        let response = r#"<think>plan</think>
<Action type="knowledge">Q1</Action>
<Action type="persona">
  multi
  line
</Action>"#;
        let parsed = parse_actions(response);
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].action_type, ActionKind::Knowledge);
        assert_eq!(parsed.items[0].instruction, "Q1");
        assert_eq!(parsed.items[1].action_type, ActionKind::Persona);
        assert_eq!(parsed.items[1].instruction, "multi\n  line");
        assert!(parsed.unknown.is_empty());
    }

    #[test]
    fn unknown_slugs_are_collected_not_dispatched() {
        let parsed = parse_actions(r#"<Action type="dance-off">x</Action><Action type="websearch">y</Action>"#);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.unknown, vec!["dance-off".to_string()]);
    }

    #[test]
    fn empty_plan() {
        let parsed = parse_actions("I have nothing to do.");
        assert!(parsed.is_empty());
        assert!(parsed.unknown.is_empty());
    }

    #[test]
    fn invalid_slug_characters_do_not_match() {
        assert!(parse_actions(r#"<Action type="bad slug">x</Action>"#).is_empty());
    }
}
