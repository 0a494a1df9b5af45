//! Parsing for streamed model output.
//!
//! - [`StreamingTagParser`]: completed `<think>` / `<Observe>` style tags
//!   from a growing buffer, each reported once.
//! - [`BlockParser`]: numbered subagent blocks (`<knowledge1>…</knowledge1>`)
//!   with title, cover text and hook children.
//! - [`parse_actions`]: `<Action type="…">` decisions from the orchestrator.
//! - [`markdown::normalize`]: idempotent markdown clean-up for block content.

pub mod actions;
pub mod blocks;
pub mod markdown;
pub mod tags;

#[cfg(test)]
mod test_support;

pub use actions::{ParsedActions, parse_actions};
pub use blocks::{BlockConfig, BlockParser, ParsedBlock};
pub use tags::{ORCHESTRATOR_TAGS, StreamingTagParser, TagInfo};
