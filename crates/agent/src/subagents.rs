//! The subagent table.
//!
//! Every subagent runs the same loop ([`crate::agent_loop::BaseAgent`]); what
//! differs is captured here as data: the system prompt, the block shape the
//! model is asked to produce, the event content kind, and the default title.

use loomi_core::action::ActionKind;
use loomi_core::event::ContentKind;
use loomi_parser::BlockConfig;

use crate::tuning::AgentRole;

/// Everything that specializes the shared loop for one action.
#[derive(Debug, Clone)]
pub struct SubagentSpec {
    pub action: ActionKind,
    pub system_prompt: String,
    pub block: BlockConfig,
}

impl SubagentSpec {
    pub fn for_action(action: ActionKind) -> Self {
        let mut block = BlockConfig::new(action.slug());
        match action {
            ActionKind::XhsPost => block = block.with_cover_text(),
            ActionKind::TiktokScript => block = block.with_cover_text().with_hook(),
            _ => {}
        }
        let system_prompt = format!("{}\n\n{}", role_brief(action), format_rules(&block));
        Self {
            action,
            system_prompt,
            block,
        }
    }

    pub fn slug(&self) -> &'static str {
        self.action.slug()
    }

    pub fn content_kind(&self) -> ContentKind {
        ContentKind::for_action(self.action)
    }

    pub fn role(&self) -> AgentRole {
        AgentRole::Action(self.action)
    }

    /// Title for the `index`-th block (zero-based) when the model gave none.
    pub fn default_title(&self, index: usize) -> String {
        format!("{} {}", self.action.display_name(), index + 1)
    }
}

fn role_brief(action: ActionKind) -> &'static str {
    match action {
        ActionKind::Knowledge => {
            "You are a market knowledge analyst. Distill the category, its trends and the \
             facts a content creator must know into short, concrete insights."
        }
        ActionKind::Persona => {
            "You are an audience researcher. Describe the target audience as distinct \
             personas: who they are, what they want, and what makes them act."
        }
        ActionKind::Websearch => {
            "You are a research assistant. Summarize what current public sources say \
             about the request, one finding per block, naming the source when known."
        }
        ActionKind::Resonant => {
            "You find emotional resonance points: the moments, phrases and tensions that \
             make the audience feel understood."
        }
        ActionKind::Revision => {
            "You are an editor. Rewrite the referenced draft following the instruction, \
             keeping its facts and improving rhythm and clarity."
        }
        ActionKind::TiktokScript => {
            "You write short-video scripts for Douyin. Open with a hook that lands in the \
             first three seconds, then give the scenes with voice-over and on-screen text."
        }
        ActionKind::BrandAnalysis => {
            "You are a brand strategist. Analyze the brand's positioning, tone and \
             differentiation against its competitors."
        }
        ActionKind::ContentAnalysis => {
            "You analyze existing content: its structure, what made it perform and what \
             can be reused."
        }
        ActionKind::Hitpoint => {
            "You propose content hitpoints: sharp selling angles, each a single idea a post \
             can be built around."
        }
        ActionKind::XhsPost => {
            "You write Xiaohongshu posts: a catchy title, warm first-person body text, \
             emoji where natural, and a short cover line."
        }
        ActionKind::WechatArticle => {
            "You write WeChat official-account articles with a clear headline, \
             sectioned body and a strong close."
        }
    }
}

fn format_rules(block: &BlockConfig) -> String {
    let tag = &block.tag;
    let mut children = format!("<{}>…</{}> first", block.title_tag, block.title_tag);
    if let Some(cover) = &block.cover_text_tag {
        children.push_str(&format!(", then <{cover}>…</{cover}> with the cover text"));
    }
    if let Some(hook) = &block.hook_tag {
        children.push_str(&format!(", then <{hook}>…</{hook}> with the opening hook"));
    }
    format!(
        "Output format: wrap each result in its own numbered block, <{tag}1>…</{tag}1>, \
         <{tag}2>…</{tag}2> and so on. Inside a block put {children}, then the body in \
         markdown. Text outside the blocks is shown to the user as a side note."
    )
}
