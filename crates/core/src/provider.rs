//! Model client contract over streamed chat completions.
//!
//! A [`ModelClient`] turns a request into a channel of [`StreamChunk`]s.
//! [`safe_stream_call`] drives that channel, handing each text fragment to a
//! [`ChunkHandler`] in order. A handler error aborts the call by dropping the
//! receiver, which stops the producing task at its next send.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, ProviderError, Result};
use crate::message::Message;

/// A streamed chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier; empty means "the client's default".
    #[serde(default)]
    pub model: String,

    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Reasoning budget in tokens, for providers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Session identity, so clients can record usage per session.
    pub user_id: String,

    pub session_id: String,
}

impl ModelRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            model: String::new(),
            messages,
            temperature: None,
            thinking_budget: None,
            max_tokens: None,
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            done: false,
            usage: None,
        }
    }

    pub fn finished(usage: Option<Usage>) -> Self {
        Self {
            content: None,
            done: true,
            usage,
        }
    }
}

pub type ChunkReceiver = mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>;

/// The streaming chat client every model backend implements.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this client (e.g. "openai").
    fn name(&self) -> &str;

    /// Start a streamed completion.
    async fn stream(&self, request: ModelRequest) -> std::result::Result<ChunkReceiver, ProviderError>;

    /// Provider-reported usage of the last completed call for a session.
    fn last_usage(&self, _user_id: &str, _session_id: &str) -> Option<Usage> {
        None
    }

    /// Whether requests may carry a reasoning budget.
    fn supports_thinking(&self) -> bool {
        false
    }
}

/// Receives model output fragments in order.
#[async_trait]
pub trait ChunkHandler: Send {
    async fn on_chunk(&mut self, text: &str) -> Result<()>;
}

/// Ambient limits carried by one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    /// Expiry cancels the stream with a timeout error.
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }
}

/// Issue one streamed call, feeding every text fragment to `handler`.
///
/// Returns when the model finishes, when the handler fails (its error is
/// propagated), or when the ambient deadline passes.
pub async fn safe_stream_call(
    client: &dyn ModelClient,
    ctx: CallContext,
    request: ModelRequest,
    handler: &mut dyn ChunkHandler,
) -> Result<Option<Usage>> {
    let mut rx = with_deadline(ctx, client.stream(request)).await??;
    let mut usage = None;

    loop {
        let Some(item) = with_deadline(ctx, rx.recv()).await? else {
            break;
        };
        let chunk = item?;
        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
            // Dropping `rx` on error closes the channel for the producer.
            handler.on_chunk(text).await?;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.done {
            break;
        }
    }

    Ok(usage)
}

async fn with_deadline<F: std::future::Future>(ctx: CallContext, fut: F) -> Result<F::Output> {
    match ctx.deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::Provider(ProviderError::Timeout("model stream deadline exceeded".into()))),
        None => Ok(fut.await),
    }
}
