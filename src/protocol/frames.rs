//! # Client Message Frames
//!
//! Text messages on `/ws/chat` are JSON envelopes:
//!
//! ```json
//! {"type": "text", "seq": 3, "content": {"content": "你好"}, "timestamp": 1700000000}
//! ```
//!
//! Inbound envelopes are parsed into a [`ClientFrame`]; everything the server
//! says goes out as an [`OutboundFrame`]. Field names here are part of the
//! client contract, so they stay exactly as browsers and the mobile client
//! expect them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::codec::CodecError;
use crate::providers::{AudioChunk, Transcript, Usage};
use crate::session::SessionConfig;

/// Field names tried, in order, when looking for audio bytes in an `audio` frame.
pub const AUDIO_FIELDS: [&str; 4] = ["audio_data", "data", "audioData", "audio"];

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid JSON message: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {0} content")]
    InvalidContent(&'static str),

    #[error("Missing text content")]
    MissingText,

    #[error("Missing audio data field (tried: audio_data, data, audioData, audio)")]
    MissingAudio,

    #[error("Failed to decode audio data: {0}")]
    AudioBase64(#[from] base64::DecodeError),

    #[error("Invalid audio data: array must contain byte values")]
    InvalidAudioArray,

    #[error("Unsupported audio data format: expected base64 string or byte array")]
    UnsupportedAudioEncoding,

    #[error("Empty audio data")]
    EmptyAudio,

    #[error("Malformed wire frame: {0}")]
    Wire(#[from] CodecError),
}

impl FrameError {
    /// Wire error code for an `error` frame. Every frame problem is the
    /// client's fault.
    pub fn code(&self) -> u16 {
        400
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
}

/// Audio carried inside a JSON `audio` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub data: Vec<u8>,
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Config(SessionConfig),
    Text(String),
    Audio(AudioPayload),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;

        match envelope.kind.as_str() {
            "config" => {
                if !envelope.content.is_object() {
                    return Err(FrameError::InvalidContent("config"));
                }
                let config = serde_json::from_value(envelope.content)
                    .map_err(|_| FrameError::InvalidContent("config"))?;
                Ok(ClientFrame::Config(config))
            }
            "text" => {
                let text = envelope
                    .content
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(FrameError::MissingText)?;
                Ok(ClientFrame::Text(text.to_string()))
            }
            "audio" | "audio_file" => parse_audio(&envelope.content).map(ClientFrame::Audio),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

fn parse_audio(content: &Value) -> Result<AudioPayload, FrameError> {
    if !content.is_object() {
        return Err(FrameError::InvalidContent("audio"));
    }

    let raw = AUDIO_FIELDS
        .iter()
        .find_map(|field| content.get(*field).filter(|v| !v.is_null()))
        .ok_or(FrameError::MissingAudio)?;

    let data = match raw {
        Value::String(encoded) => BASE64.decode(encoded.trim())?,
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or(FrameError::InvalidAudioArray)
            })
            .collect::<Result<Vec<u8>, _>>()?,
        _ => return Err(FrameError::UnsupportedAudioEncoding),
    };

    if data.is_empty() {
        return Err(FrameError::EmptyAudio);
    }

    Ok(AudioPayload {
        data,
        format: content.get("format").and_then(Value::as_str).map(str::to_string),
        sample_rate: content
            .get("sample_rate")
            .and_then(Value::as_u64)
            .and_then(|rate| u32::try_from(rate).ok()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundKind {
    #[serde(rename = "welcome")]
    Welcome,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "config_updated")]
    ConfigUpdated,
    #[serde(rename = "asr_result")]
    Transcript,
    #[serde(rename = "response")]
    TextDelta,
    #[serde(rename = "tts")]
    Audio,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "turn_complete")]
    TurnComplete,
}

/// Server to client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub content: Value,
    pub timestamp: i64,
}

impl OutboundFrame {
    fn new(kind: OutboundKind, content: Value) -> Self {
        Self {
            kind,
            seq: None,
            content,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn welcome(session_id: &str, config: &SessionConfig) -> Self {
        Self::new(
            OutboundKind::Welcome,
            json!({
                "message": "Connected to CosTalk",
                "session_id": session_id,
                "config": config,
            }),
        )
    }

    pub fn status(status: &str, message: &str) -> Self {
        Self::new(
            OutboundKind::Status,
            json!({ "status": status, "message": message }),
        )
    }

    pub fn config_updated(config: &SessionConfig) -> Self {
        Self::new(
            OutboundKind::ConfigUpdated,
            json!({
                "message": "Configuration updated",
                "config": config,
                "providers": config.effective_providers(),
            }),
        )
    }

    pub fn transcript(transcript: &Transcript) -> Self {
        Self::new(
            OutboundKind::Transcript,
            json!({
                "text": transcript.text,
                "is_final": transcript.is_final,
                "confidence": transcript.confidence,
            }),
        )
    }

    pub fn text_delta(delta: &str, accumulated: &str, is_first: bool, is_done: bool) -> Self {
        Self::new(
            OutboundKind::TextDelta,
            json!({
                "text": delta,
                "accumulated": accumulated,
                "is_first": is_first,
                "is_done": is_done,
            }),
        )
    }

    /// One synthesized audio chunk. `sequence` is the connection-wide audio
    /// sequence number and doubles as the envelope `seq`.
    pub fn audio(sequence: u64, chunk: &AudioChunk, sentence: &str) -> Self {
        let mut frame = Self::new(
            OutboundKind::Audio,
            json!({
                "audio": BASE64.encode(&chunk.data),
                "format": chunk.format,
                "sequence": sequence,
                "text": sentence,
            }),
        );
        frame.seq = Some(sequence);
        frame
    }

    pub fn error(code: u16, message: &str) -> Self {
        Self::new(
            OutboundKind::Error,
            json!({ "code": code, "message": message }),
        )
    }

    pub fn turn_complete(text: &str, usage: Option<&Usage>) -> Self {
        let mut content = json!({ "text": text });
        if let Some(usage) = usage {
            content["usage"] = json!(usage);
        }
        Self::new(OutboundKind::TurnComplete, content)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
