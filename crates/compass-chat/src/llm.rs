//! Text-generation backends.
//!
//! A backend turns a [`ModelRequest`] into a channel of [`ModelChunk`]s.
//! The producing task stops as soon as the receiver is dropped, which
//! closes the upstream connection.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use compass_core::config::ModelConfig;
use compass_core::types::{Role, Usage};

use crate::error::ModelError;

/// Chunks buffered between the backend task and the pipeline.
const CHUNK_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: String,
}

impl ModelMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    /// Conversation history ending with the current user turn.
    pub messages: Vec<ModelMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Delta(String),
    /// Token accounting reported by the backend, usually last.
    Usage(Usage),
}

pub type ChunkReceiver = mpsc::Receiver<Result<ModelChunk, ModelError>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start generating. An `Err` here means nothing was produced.
    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ModelError>;
}

// =============================================================================
// OpenAI-compatible chat completions
// =============================================================================

/// Streams from any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatBackend {
    pub fn new(config: &ModelConfig, api_key: String) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn build_request_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": Role::System.as_str(),
            "content": request.system,
        })];
        messages.extend(request.messages.iter().map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        }));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// What one SSE line from the backend means.
#[derive(Debug, PartialEq)]
enum SseLine {
    Chunks(Vec<ModelChunk>),
    Done,
    Skip,
}

/// Splits the raw response body into lines.
///
/// Bytes are kept until their line is complete, so a character split across
/// network chunks is decoded whole.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

fn parse_sse_line(line: &str) -> Result<SseLine, ModelError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| ModelError::Decode(e.to_string()))?;
    let mut out: Vec<ModelChunk> = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(ModelChunk::Delta)
        .collect();
    if let Some(usage) = chunk.usage {
        out.push(ModelChunk::Usage(Usage::new(
            usage.prompt_tokens,
            usage.completion_tokens,
        )));
    }
    Ok(SseLine::Chunks(out))
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ModelError> {
        let body = self.build_request_body(&request);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
            return Err(ModelError::Status { status, body });
        }

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = LineSplitter::default();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Model stream receiver dropped, closing upstream");
                        return;
                    }
                    next = stream.next() => next,
                };
                let Some(bytes) = next else {
                    let _ = tx
                        .send(Err(ModelError::Stream(
                            "connection closed before end of stream".to_string(),
                        )))
                        .await;
                    return;
                };
                let bytes = match bytes {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        Ok(SseLine::Done) => return,
                        Ok(SseLine::Skip) => {}
                        Ok(SseLine::Chunks(chunks)) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed model stream line");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

// =============================================================================
// Scripted backend
// =============================================================================

/// Replays fixed chunks. Used offline when no API key is configured and
/// as a deterministic backend in tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    chunks: Vec<String>,
    usage: Option<Usage>,
    /// Fail before producing anything.
    fail_on_start: bool,
    /// Fail after this many chunks.
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Offline stand-in that reflects the user's message back.
    pub fn offline_echo() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn failing_on_start() -> Self {
        Self {
            fail_on_start: true,
            ..Self::default()
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Pause between chunks.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn script_for(&self, request: &ModelRequest) -> Vec<String> {
        if !self.chunks.is_empty() {
            return self.chunks.clone();
        }
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!(
            "I'm running offline right now, but I hear you: \"{}\". What feels most important about that?",
            last
        )
        .split_inclusive(' ')
        .map(str::to_string)
        .collect()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ModelError> {
        if self.fail_on_start {
            return Err(ModelError::Unavailable("scripted failure".to_string()));
        }

        let chunks = self.script_for(&request);
        let usage = self.usage;
        let fail_after = self.fail_after;
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);

        tokio::spawn(async move {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(ModelError::Stream("scripted interruption".to_string())))
                        .await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(ModelChunk::Delta(chunk))).await.is_err() {
                    return;
                }
            }
            if let Some(usage) = usage {
                let _ = tx.send(Ok(ModelChunk::Usage(usage))).await;
            }
        });
        Ok(rx)
    }
}

/// Pick the backend for `config`: the real endpoint when its API key is
/// set, otherwise the offline echo.
pub fn backend_from_config(config: &ModelConfig) -> Result<Box<dyn ModelBackend>, ModelError> {
    match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            info!(model = %config.model, base_url = %config.base_url, "Using model endpoint");
            Ok(Box::new(OpenAiCompatBackend::new(config, key)?))
        }
        _ => {
            warn!(
                "{} is not set; responses will come from the offline echo backend",
                config.api_key_env
            );
            Ok(Box::new(ScriptedBackend::offline_echo()))
        }
    }
}
