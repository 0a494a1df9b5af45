//! Stream events: the typed envelope delivered to downstream consumers.
//!
//! Every event is `{type, content_type, data, meta?}`. Emission order is the
//! contract with the client, so producers emit through an [`EventSink`]
//! which serializes concurrent writers (an mpsc channel in practice).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::action::ActionKind;
use crate::error::{Error, Result};

/// Envelope type of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LlmChunk,
    Error,
}

/// What the payload of a stream event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Thought,
    OrchestratorMessage,
    SystemMessage,
    BillingSummary,
    AgentOtherMessage,
    #[serde(rename = "loomi_knowledge")]
    Knowledge,
    #[serde(rename = "loomi_persona")]
    Persona,
    #[serde(rename = "loomi_websearch")]
    Websearch,
    #[serde(rename = "loomi_resonant")]
    Resonant,
    #[serde(rename = "loomi_revision")]
    Revision,
    #[serde(rename = "loomi_tiktok_script")]
    TiktokScript,
    #[serde(rename = "loomi_brand_analysis")]
    BrandAnalysis,
    #[serde(rename = "loomi_content_analysis")]
    ContentAnalysis,
    #[serde(rename = "loomi_hitpoint")]
    Hitpoint,
    #[serde(rename = "loomi_xhs_post")]
    XhsPost,
    #[serde(rename = "loomi_wechat_article")]
    WechatArticle,
}

impl ContentKind {
    /// The `loomi_<slug>` content kind for a subagent.
    pub fn for_action(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Knowledge => ContentKind::Knowledge,
            ActionKind::Persona => ContentKind::Persona,
            ActionKind::Websearch => ContentKind::Websearch,
            ActionKind::Resonant => ContentKind::Resonant,
            ActionKind::Revision => ContentKind::Revision,
            ActionKind::TiktokScript => ContentKind::TiktokScript,
            ActionKind::BrandAnalysis => ContentKind::BrandAnalysis,
            ActionKind::ContentAnalysis => ContentKind::ContentAnalysis,
            ActionKind::Hitpoint => ContentKind::Hitpoint,
            ActionKind::XhsPost => ContentKind::XhsPost,
            ActionKind::WechatArticle => ContentKind::WechatArticle,
        }
    }
}

/// A single event on the output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,

    pub content_type: ContentKind,

    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StreamEvent {
    /// A regular content event.
    pub fn chunk(content_type: ContentKind, data: impl Into<serde_json::Value>) -> Self {
        Self {
            event_type: EventType::LlmChunk,
            content_type,
            data: data.into(),
            meta: None,
        }
    }

    /// A fatal-condition event.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            content_type: ContentKind::SystemMessage,
            data: serde_json::Value::String(message.into()),
            meta: None,
        }
    }

    /// Attach one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn meta_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }

    /// SSE `data:` frame for this event.
    pub fn to_sse_frame(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Terminal SSE framing that marks end-of-stream.
pub const SSE_DONE_FRAME: &str = "event: done\n\ndata: {}\n\n";

/// Caller-supplied event emitter. Returning an error aborts the producing
/// stream at its next yield point.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent) -> Result<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.send(event)
            .await
            .map_err(|_| Error::EventSink("receiver dropped".into()))
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<StreamEvent> {
    async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.send(event)
            .map_err(|_| Error::EventSink("receiver dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialization() {
        let event = StreamEvent::chunk(ContentKind::Thought, "thinking about it")
            .with_meta("agent", "knowledge");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"llm_chunk""#));
        assert!(json.contains(r#""content_type":"thought""#));
        assert!(json.contains(r#""meta":{"agent":"knowledge"}"#));
    }

    #[test]
    fn meta_omitted_when_absent() {
        let json = serde_json::to_string(&StreamEvent::chunk(ContentKind::SystemMessage, "x")).unwrap();
        assert!(!json.contains("meta"));
    }

    #[test]
    fn agent_content_kinds_use_loomi_prefix() {
        let json = serde_json::to_string(&ContentKind::for_action(ActionKind::XhsPost)).unwrap();
        assert_eq!(json, r#""loomi_xhs_post""#);
        let json = serde_json::to_string(&ContentKind::OrchestratorMessage).unwrap();
        assert_eq!(json, r#""orchestrator_message""#);
    }

    #[test]
    fn error_event_type() {
        let event = StreamEvent::error("boom");
        assert_eq!(event.event_type, EventType::Error);
        let frame = event.to_sse_frame().unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn mpsc_sink_delivers_in_order_and_fails_when_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.emit(StreamEvent::chunk(ContentKind::Thought, "a")).await.unwrap();
        tx.emit(StreamEvent::chunk(ContentKind::Thought, "b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data, "a");
        assert_eq!(rx.recv().await.unwrap().data, "b");

        drop(rx);
        let err = tx.emit(StreamEvent::chunk(ContentKind::Thought, "c")).await.unwrap_err();
        assert!(matches!(err, Error::EventSink(_)));
    }
}
