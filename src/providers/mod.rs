//! # Provider Contracts
//!
//! Every vendor integration plugs into the pipeline through one of four
//! capability traits:
//!
//! - [`AsrProvider`]: speech to text, streaming or one-shot
//! - [`LlmProvider`]: chat completions, blocking or streamed
//! - [`TtsProvider`]: text stream to audio chunk stream
//! - [`ModerationProvider`]: optional text screening before the LLM
//!
//! ## Key Rust Concepts:
//! - **async-trait**: the traits are used as `Arc<dyn Trait>` trait objects,
//!   so async methods are boxed via `#[async_trait]`
//! - **BoxStream**: streaming results are `'static` boxed streams that the
//!   caller drains and may drop early
//! - **thiserror**: one typed error for every adapter
//!
//! ## Cancellation:
//! Each call takes the connection's [`CancelToken`]. Adapters must stop their
//! network I/O and end their streams promptly once it fires.

pub mod credentials;
pub mod iflytek;
pub mod qiniu;
pub mod qwen;
pub mod registry;
pub(crate) mod socket;
pub(crate) mod sse;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::protocol::codec::CodecError;

pub use registry::{ProviderInfo, ProviderRegistry};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Items of a streaming provider call. The stream ends when the vendor is
/// done, on the first error, or on cancellation.
pub type ProviderStream<T> = BoxStream<'static, ProviderResult<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Asr,
    Llm,
    Tts,
    Moderation,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Asr,
        ProviderKind::Llm,
        ProviderKind::Tts,
        ProviderKind::Moderation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Asr => "asr",
            ProviderKind::Llm => "llm",
            ProviderKind::Tts => "tts",
            ProviderKind::Moderation => "moderation",
        }
    }

    /// Operations every provider of this kind supports.
    pub fn capabilities(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Asr => &["stream_recognize", "recognize_batch"],
            ProviderKind::Llm => &["chat", "chat_stream"],
            ProviderKind::Tts => &["synthesize_stream"],
            ProviderKind::Moderation => &["check_text"],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider kind '{}'", s))
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{kind} provider '{name}' not found")]
    NotFound { kind: ProviderKind, name: String },

    #[error("request to {provider} failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} sent an invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("wire protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("{provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    /// Output was already delivered when the provider failed, so retrying
    /// elsewhere would duplicate it.
    #[error("{provider} failed mid-stream: {message}")]
    Interrupted { provider: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("no {kind} provider available: {last}")]
    Exhausted {
        kind: ProviderKind,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    pub fn request(provider: &str, err: impl fmt::Display) -> Self {
        ProviderError::Request {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid(provider: &str, message: impl fmt::Display) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether trying the next provider in a fallback chain makes sense.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::Cancelled | ProviderError::Interrupted { .. } | ProviderError::Exhausted { .. }
        )
    }

    /// Code reported in `error` frames.
    pub fn code(&self) -> u16 {
        match self {
            ProviderError::NotFound { .. } => 404,
            ProviderError::Exhausted { last, .. } => last.code(),
            ProviderError::Cancelled => 500,
            _ => 502,
        }
    }
}

// ----------------------------------------------------------------------------
// Domain types
// ----------------------------------------------------------------------------

/// Confidence reported for transcripts when the vendor gives none.
pub const DEFAULT_TRANSCRIPT_CONFIDENCE: f32 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    /// Vendor model id; `None` means the adapter's default.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ChatDelta {
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.as_deref().is_some_and(|reason| !reason.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub format: String,
    /// Vendor-side chunk index; not the connection-wide audio sequence.
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsOptions {
    pub voice: String,
    pub style: Option<String>,
    pub speed: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    Pass,
    Warn,
    Rewrite,
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub action: ModerationAction,
    pub score: f32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

// ----------------------------------------------------------------------------
// Capability traits
// ----------------------------------------------------------------------------

#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize a live audio stream. Transcripts arrive as the vendor
    /// produces them; at most one per utterance is marked final.
    async fn stream_recognize(
        &self,
        audio: BoxStream<'static, Vec<u8>>,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<Transcript>>;

    /// Recognize one complete recording.
    async fn recognize_batch(&self, audio: Vec<u8>, cancel: CancelToken) -> ProviderResult<String>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest, cancel: CancelToken) -> ProviderResult<ChatResponse>;

    /// Stream a completion. The terminal delta carries a finish reason and,
    /// when the vendor reports it, token usage.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<ChatDelta>>;
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesize every text item of `text`, in order, into audio chunks.
    async fn synthesize_stream(
        &self,
        text: BoxStream<'static, String>,
        options: TtsOptions,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<AudioChunk>>;
}

#[async_trait]
pub trait ModerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn check_text(&self, text: &str, cancel: CancelToken) -> ProviderResult<ModerationResult>;
}
