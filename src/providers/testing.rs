//! Deterministic provider doubles and a capturing frame sink for tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    AsrProvider, AudioChunk, ChatDelta, ChatRequest, ChatResponse, LlmProvider, ModerationAction,
    ModerationProvider, ModerationResult, ProviderError, ProviderResult, ProviderStream, Transcript,
    TtsOptions, TtsProvider, Usage, DEFAULT_TRANSCRIPT_CONFIDENCE,
};
use crate::cancel::CancelToken;
use crate::protocol::{OutboundFrame, OutboundKind};
use crate::session::{FrameSink, TransportError};

async fn pause(delay: Duration, cancel: &CancelToken) -> ProviderResult<()> {
    if delay.is_zero() {
        return Ok(());
    }
    cancel
        .run_until_cancelled(tokio::time::sleep(delay))
        .await
        .ok_or(ProviderError::Cancelled)
}

// ----------------------------------------------------------------------------
// ASR
// ----------------------------------------------------------------------------

pub struct ScriptedAsr {
    name: String,
    text: String,
    delay: Duration,
    fail: bool,
    pub calls: AtomicUsize,
}

impl ScriptedAsr {
    pub fn new(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            text: text.to_string(),
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self { fail: true, ..Self::new(name, "") }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AsrProvider for ScriptedAsr {
    fn name(&self) -> &str {
        &self.name
    }

    /// Consumes the whole audio stream, then reports one interim and one
    /// final transcript.
    async fn stream_recognize(
        &self,
        audio: BoxStream<'static, Vec<u8>>,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<Transcript>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::request(&self.name, "scripted failure"));
        }

        let (tx, rx) = mpsc::channel(8);
        let text = self.text.clone();
        tokio::spawn(async move {
            let mut audio = audio;
            let mut bytes = 0usize;
            while let Some(Some(chunk)) = cancel.run_until_cancelled(audio.next()).await {
                bytes += chunk.len();
            }
            if cancel.is_cancelled() || bytes == 0 {
                return;
            }
            let half: String = text.chars().take(text.chars().count() / 2).collect();
            let _ = tx
                .send(Ok(Transcript { text: half, is_final: false, confidence: 0.5 }))
                .await;
            let _ = tx
                .send(Ok(Transcript { text, is_final: true, confidence: DEFAULT_TRANSCRIPT_CONFIDENCE }))
                .await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn recognize_batch(&self, _audio: Vec<u8>, cancel: CancelToken) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay, &cancel).await?;
        if self.fail {
            return Err(ProviderError::request(&self.name, "scripted failure"));
        }
        Ok(self.text.clone())
    }
}

// ----------------------------------------------------------------------------
// LLM
// ----------------------------------------------------------------------------

pub struct ScriptedLlm {
    name: String,
    deltas: Vec<String>,
    delay: Duration,
    fail_to_start: bool,
    fail_after: Option<usize>,
    usage: Option<Usage>,
    hold_open: bool,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(name: &str, deltas: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            delay: Duration::ZERO,
            fail_to_start: false,
            fail_after: None,
            usage: None,
            hold_open: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self { fail_to_start: true, ..Self::new(name, &[]) }
    }

    /// Emit `count` deltas, then fail the stream.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Keep the stream open after the finish delta until cancellation.
    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest, _cancel: CancelToken) -> ProviderResult<ChatResponse> {
        self.requests.lock().unwrap().push(request);
        if self.fail_to_start {
            return Err(ProviderError::request(&self.name, "scripted failure"));
        }
        Ok(ChatResponse {
            text: self.deltas.concat(),
            finish_reason: Some("stop".to_string()),
            usage: self.usage,
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<ChatDelta>> {
        self.requests.lock().unwrap().push(request);
        if self.fail_to_start {
            return Err(ProviderError::request(&self.name, "scripted failure"));
        }

        let (tx, rx) = mpsc::channel(8);
        let name = self.name.clone();
        let deltas = self.deltas.clone();
        let delay = self.delay;
        let fail_after = self.fail_after;
        let usage = self.usage;
        let hold_open = self.hold_open;

        tokio::spawn(async move {
            for (index, text) in deltas.into_iter().enumerate() {
                if fail_after == Some(index) {
                    let _ = tx.send(Err(ProviderError::request(&name, "stream broke"))).await;
                    return;
                }
                if let Err(e) = pause(delay, &cancel).await {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                if tx.send(Ok(ChatDelta { text, ..Default::default() })).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(ChatDelta {
                    text: String::new(),
                    finish_reason: Some("stop".to_string()),
                    usage,
                }))
                .await;
            if hold_open {
                cancel.cancelled().await;
            }
            drop(tx);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ----------------------------------------------------------------------------
// TTS
// ----------------------------------------------------------------------------

pub struct ScriptedTts {
    name: String,
    chunks_per_text: usize,
    /// Latency applied to texts containing the key.
    delays: Vec<(String, Duration)>,
    fail_on: Option<String>,
    fail_after_first_chunk: bool,
    pub calls: AtomicUsize,
    pub options: Mutex<Vec<TtsOptions>>,
}

impl ScriptedTts {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            chunks_per_text: 2,
            delays: Vec::new(),
            fail_on: None,
            fail_after_first_chunk: false,
            calls: AtomicUsize::new(0),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, key: &str, delay: Duration) -> Self {
        self.delays.push((key.to_string(), delay));
        self
    }

    /// Fail (before any audio) on texts containing `key`; "" fails everything.
    pub fn failing_on(mut self, key: &str) -> Self {
        self.fail_on = Some(key.to_string());
        self
    }

    /// Fail after emitting the first chunk of every text.
    pub fn failing_mid_stream(mut self) -> Self {
        self.fail_after_first_chunk = true;
        self
    }
}

/// Chunk bytes produced by [`ScriptedTts`] for chunk `index` of `text`.
pub fn scripted_audio(text: &str, index: usize) -> Vec<u8> {
    format!("{}#{}", text, index).into_bytes()
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize_stream(
        &self,
        text: BoxStream<'static, String>,
        options: TtsOptions,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<AudioChunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.options.lock().unwrap().push(options);

        let (tx, rx) = mpsc::channel(8);
        let name = self.name.clone();
        let chunks = self.chunks_per_text;
        let delays = self.delays.clone();
        let fail_on = self.fail_on.clone();
        let fail_mid = self.fail_after_first_chunk;

        tokio::spawn(async move {
            let mut text = text;
            while let Some(item) = text.next().await {
                let delay = delays
                    .iter()
                    .find(|(key, _)| item.contains(key.as_str()))
                    .map(|(_, d)| *d)
                    .unwrap_or(Duration::ZERO);
                if let Err(e) = pause(delay, &cancel).await {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                if fail_on.as_deref().is_some_and(|key| item.contains(key)) {
                    let _ = tx.send(Err(ProviderError::request(&name, "scripted failure"))).await;
                    return;
                }
                for index in 0..chunks {
                    if fail_mid && index == 1 {
                        let _ = tx.send(Err(ProviderError::request(&name, "stream broke"))).await;
                        return;
                    }
                    let chunk = AudioChunk {
                        data: scripted_audio(&item, index),
                        format: "mp3".to_string(),
                        sequence_number: index as u32,
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ----------------------------------------------------------------------------
// Moderation
// ----------------------------------------------------------------------------

pub struct ScriptedModerator {
    name: String,
    action: ModerationAction,
}

impl ScriptedModerator {
    pub fn new(name: &str, action: ModerationAction) -> Self {
        Self { name: name.to_string(), action }
    }
}

#[async_trait]
impl ModerationProvider for ScriptedModerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_text(&self, _text: &str, _cancel: CancelToken) -> ProviderResult<ModerationResult> {
        Ok(ModerationResult {
            action: self.action,
            score: if self.action == ModerationAction::Pass { 0.0 } else { 0.9 },
            labels: vec!["scripted".to_string()],
            reason: None,
        })
    }
}

// ----------------------------------------------------------------------------
// Frame sinks
// ----------------------------------------------------------------------------

struct CaptureSink {
    frames: mpsc::UnboundedSender<OutboundFrame>,
}

#[async_trait]
impl FrameSink for CaptureSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let frame: OutboundFrame = serde_json::from_str(&text)?;
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// A sink that hands every written frame back to the test.
pub fn capture_sink() -> (Box<dyn FrameSink>, mpsc::UnboundedReceiver<OutboundFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(CaptureSink { frames: tx }), rx)
}

pub struct FailingSink;

#[async_trait]
impl FrameSink for FailingSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        Err(TransportError::Write("broken pipe".to_string()))
    }
}

/// Collect frames up to and including the first one of `kind`.
pub async fn collect_until(
    frames: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    kind: OutboundKind,
) -> Vec<OutboundFrame> {
    let mut seen = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}; got {:?}", kind, seen))
            .unwrap_or_else(|| panic!("sink closed before {:?}; got {:?}", kind, seen));
        let done = frame.kind == kind;
        seen.push(frame);
        if done {
            return seen;
        }
    }
}

/// Frames received within `wait`, without blocking longer.
pub async fn drain_for(
    frames: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    wait: Duration,
) -> Vec<OutboundFrame> {
    let mut seen = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(wait, frames.recv()).await {
        seen.push(frame);
    }
    seen
}
