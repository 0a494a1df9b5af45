//! The closed set of subagent action kinds.
//!
//! Every `<Action type="slug">` the orchestrator can dispatch maps to one
//! [`ActionKind`]. Slugs outside this set are unknown and get dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A subagent action slug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Knowledge,
    Persona,
    Websearch,
    Resonant,
    Revision,
    TiktokScript,
    BrandAnalysis,
    ContentAnalysis,
    Hitpoint,
    XhsPost,
    WechatArticle,
}

impl ActionKind {
    /// All action kinds, in declaration order.
    pub const ALL: [ActionKind; 11] = [
        ActionKind::Knowledge,
        ActionKind::Persona,
        ActionKind::Websearch,
        ActionKind::Resonant,
        ActionKind::Revision,
        ActionKind::TiktokScript,
        ActionKind::BrandAnalysis,
        ActionKind::ContentAnalysis,
        ActionKind::Hitpoint,
        ActionKind::XhsPost,
        ActionKind::WechatArticle,
    ];

    /// The wire slug (`tiktok_script`, `xhs_post`, ...).
    pub fn slug(&self) -> &'static str {
        match self {
            ActionKind::Knowledge => "knowledge",
            ActionKind::Persona => "persona",
            ActionKind::Websearch => "websearch",
            ActionKind::Resonant => "resonant",
            ActionKind::Revision => "revision",
            ActionKind::TiktokScript => "tiktok_script",
            ActionKind::BrandAnalysis => "brand_analysis",
            ActionKind::ContentAnalysis => "content_analysis",
            ActionKind::Hitpoint => "hitpoint",
            ActionKind::XhsPost => "xhs_post",
            ActionKind::WechatArticle => "wechat_article",
        }
    }

    /// Parse a wire slug. Returns `None` for unknown slugs.
    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }

    /// Human-facing name used for default block titles.
    pub fn display_name(&self) -> &'static str {
        match self {
            ActionKind::Knowledge => "知识洞察",
            ActionKind::Persona => "人群画像",
            ActionKind::Websearch => "搜索结果",
            ActionKind::Resonant => "共鸣点",
            ActionKind::Revision => "修改稿",
            ActionKind::TiktokScript => "抖音脚本",
            ActionKind::BrandAnalysis => "品牌分析",
            ActionKind::ContentAnalysis => "内容分析",
            ActionKind::Hitpoint => "打点",
            ActionKind::XhsPost => "小红书帖子",
            ActionKind::WechatArticle => "公众号文章",
        }
    }

    /// Note select flag: 1 for automatically surfaced artifacts, 0 for
    /// user-curated ones.
    pub fn select_flag(&self) -> u8 {
        match self {
            ActionKind::Websearch
            | ActionKind::Persona
            | ActionKind::BrandAnalysis
            | ActionKind::Knowledge
            | ActionKind::ContentAnalysis
            | ActionKind::Resonant => 1,
            ActionKind::Hitpoint
            | ActionKind::XhsPost
            | ActionKind::WechatArticle
            | ActionKind::TiktokScript
            | ActionKind::Revision => 0,
        }
    }

    /// Whether outputs of this kind vary a lot between runs (creative drafts).
    pub fn is_high_variation(&self) -> bool {
        matches!(
            self,
            ActionKind::Hitpoint
                | ActionKind::TiktokScript
                | ActionKind::WechatArticle
                | ActionKind::XhsPost
                | ActionKind::Revision
        )
    }
}

/// Select flag for an arbitrary slug; unknown slugs default to 0.
pub fn select_flag_for_slug(slug: &str) -> u8 {
    ActionKind::from_slug(slug).map_or(0, |kind| kind.select_flag())
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}
