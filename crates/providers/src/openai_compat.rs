//! OpenAI-compatible streaming model client.
//!
//! Works with any endpoint exposing `/chat/completions` with SSE streaming:
//! OpenAI, OpenRouter, vLLM, Ollama, and most hosted gateways.

use async_trait::async_trait;
use futures::StreamExt;
use loomi_core::error::ProviderError;
use loomi_core::message::Message;
use loomi_core::provider::{ChunkReceiver, ModelClient, ModelRequest, StreamChunk, Usage};
use loomi_core::request::SessionKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Usage reported per session by the last completed stream, with the time it
/// was recorded.
type UsageMap = Arc<Mutex<HashMap<SessionKey, (Usage, Instant)>>>;

/// Unclaimed usage older than this is dropped on the next insert.
const USAGE_RETENTION: Duration = Duration::from_secs(10 * 60);

pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
    usage: UsageMap,
    thinking: bool,
}

impl OpenAiCompatClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            client,
            usage: Arc::new(Mutex::new(HashMap::new())),
            thinking: false,
        })
    }

    /// Forward reasoning budgets as a `thinking` parameter.
    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking = enabled;
        self
    }

    /// OpenAI proper.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, model, Duration::from_secs(120))
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    fn request_body(&self, request: &ModelRequest) -> serde_json::Value {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };

        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(budget) = request.thinking_budget.filter(|_| self.thinking) {
            body["thinking"] = serde_json::json!({ "type": "enabled", "budget_tokens": budget });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        debug!(
            provider = %self.name,
            model = %body["model"],
            user_id = %request.user_id,
            session_id = %request.session_id,
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();
        let usage_map = self.usage.clone();
        let session = SessionKey::new(&request.user_id, &request.session_id);

        // Read the SSE byte stream and forward content deltas
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    match event {
                        SseEvent::Content(text) => {
                            if tx.send(Ok(StreamChunk::text(text))).await.is_err() {
                                trace!(provider = %provider_name, "Receiver dropped, ending stream");
                                return;
                            }
                        }
                        SseEvent::Usage(usage) => {
                            if let Ok(mut map) = usage_map.lock() {
                                let now = Instant::now();
                                map.retain(|_, (_, at)| now.duration_since(*at) < USAGE_RETENTION);
                                map.insert(session.clone(), (usage, now));
                            }
                            let _ = tx.send(Ok(StreamChunk::finished(Some(usage)))).await;
                            return;
                        }
                        SseEvent::Done => {
                            let _ = tx.send(Ok(StreamChunk::finished(None))).await;
                            return;
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(StreamChunk::finished(None))).await;
        });

        Ok(rx)
    }

    /// Takes the recorded usage, so each report is claimed at most once.
    fn supports_thinking(&self) -> bool {
        self.thinking
    }

    fn last_usage(&self, user_id: &str, session_id: &str) -> Option<Usage> {
        let mut map = self.usage.lock().ok()?;
        map.remove(&SessionKey::new(user_id, session_id)).map(|(usage, _)| usage)
    }
}

// --- SSE decoding ---

#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Content(String),
    Usage(Usage),
    Done,
}

/// Splits a byte stream into `data:` lines and interprets them.
///
/// Bytes are buffered until a full line has arrived, so a multi-byte
/// character split across network chunks is decoded whole.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(resp) => {
                    if let Some(text) = resp
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.clone())
                        .filter(|c| !c.is_empty())
                    {
                        events.push(SseEvent::Content(text));
                    }
                    if let Some(u) = resp.usage {
                        events.push(SseEvent::Usage(Usage::new(u.prompt_tokens, u.completion_tokens)));
                    }
                }
                Err(e) => trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk"),
            }
        }
        events
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
