//! # Session Orchestrator
//!
//! One [`Session`] drives one client connection through the voice pipeline:
//!
//! ```text
//! audio ──► ASR ──► transcript ─┐
//!                               ├─► text stage: moderation → LLM stream ──► sentences ──► TTS ──► audio frames
//! text  ────────────────────────┘
//! ```
//!
//! ## Tasks per connection:
//! - **dispatch loop** (`Session::run`): reads inbound messages in arrival
//!   order, applies configuration, and hands work off without blocking
//! - **recognition tasks**: one short-lived task per audio upload, plus at most
//!   one live recognition task fed by wire-protocol audio frames
//! - **text stage**: a single worker that runs turns one after another, so
//!   replies never overlap
//! - **synthesis worker**: one per turn, see [`SequentialSynthesizer`]
//!
//! All of them share the connection's [`CancelToken`] and write through one
//! [`OutboundWriter`]. Closing the connection cancels every one of them.
//!
//! ## Configuration snapshots:
//! Work captures an `Arc<SessionConfig>` when it is dispatched. A later
//! configuration frame replaces the session's current snapshot but never
//! changes work already in flight.

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::state::SessionStateCell;
use super::writer::{FrameSink, OutboundWriter, TransportError};
use crate::cancel::CancelToken;
use crate::config::SessionSettings;
use crate::pipeline::{SentenceSegmenter, SequentialSynthesizer, SynthesisPlan};
use crate::protocol::codec::{self, MessageType, WireFrame};
use crate::protocol::{ClientFrame, FrameError, OutboundFrame};
use crate::providers::{
    ChatMessage, ChatRequest, ModerationAction, ProviderError, ProviderRegistry, Transcript,
    DEFAULT_TRANSCRIPT_CONFIDENCE,
};
use crate::roles::RoleCatalog;

/// Error code for content rejected by moderation.
pub const BLOCKED_CONTENT_CODE: u16 = 451;

/// A message received from the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Read-only dependencies shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<ProviderRegistry>,
    pub roles: Arc<RoleCatalog>,
    pub settings: SessionSettings,
}

/// A user utterance waiting for the text stage.
#[derive(Debug)]
struct Utterance {
    text: String,
    config: Arc<SessionConfig>,
}

/// State shared by the dispatch loop and every task it spawns.
struct Pipeline {
    session_id: String,
    deps: SessionDeps,
    writer: OutboundWriter,
    synthesizer: Arc<SequentialSynthesizer>,
    state: SessionStateCell,
    cancel: CancelToken,
}

pub struct Session {
    pipeline: Arc<Pipeline>,
    config: Arc<SessionConfig>,
    utterances: mpsc::Sender<Utterance>,
    utterance_rx: Option<mpsc::Receiver<Utterance>>,
    live_audio: Option<mpsc::Sender<Vec<u8>>>,
}

impl Session {
    pub fn new(session_id: &str, deps: SessionDeps, sink: Box<dyn FrameSink>, cancel: CancelToken) -> Self {
        let writer = OutboundWriter::new(sink, cancel.clone(), session_id);
        let synthesizer = Arc::new(SequentialSynthesizer::new(deps.registry.clone(), writer.clone()));
        let (utterances, utterance_rx) = mpsc::channel(deps.settings.text_queue_capacity);

        Self {
            pipeline: Arc::new(Pipeline {
                session_id: session_id.to_string(),
                deps,
                writer,
                synthesizer,
                state: SessionStateCell::new(),
                cancel,
            }),
            config: Arc::new(SessionConfig::default()),
            utterances,
            utterance_rx: Some(utterance_rx),
            live_audio: None,
        }
    }

    pub fn state(&self) -> SessionStateCell {
        self.pipeline.state.clone()
    }

    /// Run until the inbound channel closes, the scope is cancelled, or the
    /// transport fails.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundMessage>) {
        let session_id = self.pipeline.session_id.clone();
        info!(session_id = %session_id, "Session started");

        if let Some(rx) = self.utterance_rx.take() {
            tokio::spawn(self.pipeline.clone().run_text_stage(rx));
        }

        let welcome = OutboundFrame::welcome(&session_id, &self.config);
        if self.pipeline.writer.send(welcome).await.is_ok() {
            while let Some(Some(message)) = self
                .pipeline
                .cancel
                .run_until_cancelled(inbound.recv())
                .await
            {
                if let Err(e) = self.dispatch(message).await {
                    warn!(session_id = %session_id, error = %e, "Transport failed, ending session");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn dispatch(&mut self, message: InboundMessage) -> Result<(), TransportError> {
        match message {
            InboundMessage::Text(text) => self.handle_client_frame(&text).await,
            InboundMessage::Binary(bytes) => self.handle_binary(bytes).await,
        }
    }

    async fn handle_client_frame(&mut self, text: &str) -> Result<(), TransportError> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.pipeline.session_id, error = %e, "Rejected client frame");
                return self.pipeline.writer.send_error(e.code(), &e.to_string()).await;
            }
        };

        match frame {
            ClientFrame::Config(config) => {
                info!(
                    session_id = %self.pipeline.session_id,
                    providers = %config.effective_providers(),
                    "Session configuration replaced"
                );
                self.config = Arc::new(config);
                self.pipeline.state.configure();
                self.pipeline
                    .writer
                    .send(OutboundFrame::config_updated(&self.config))
                    .await
            }
            ClientFrame::Text(text) => {
                self.pipeline.forward(&self.utterances, text, self.config.clone());
                Ok(())
            }
            ClientFrame::Audio(payload) => {
                debug!(
                    session_id = %self.pipeline.session_id,
                    bytes = payload.data.len(),
                    format = payload.format.as_deref().unwrap_or("unknown"),
                    "Audio frame received"
                );
                self.spawn_batch_recognition(payload.data);
                Ok(())
            }
        }
    }

    async fn handle_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return self.pipeline.writer.send_error(400, "Empty binary message").await;
        }
        if !codec::looks_like_client_frame(&bytes) {
            self.spawn_batch_recognition(bytes);
            return Ok(());
        }

        match WireFrame::decode(&bytes) {
            Ok(frame) => self.handle_wire_frame(frame).await,
            Err(e) => {
                let e = FrameError::from(e);
                warn!(session_id = %self.pipeline.session_id, error = %e, "Rejected wire frame");
                self.pipeline.writer.send_error(e.code(), &e.to_string()).await
            }
        }
    }

    async fn handle_wire_frame(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        match frame.message_type {
            MessageType::FullClientRequest => match frame.parse_json::<Value>() {
                Ok(request) => {
                    self.config = Arc::new(self.config.with_audio_params(&request));
                    self.pipeline.state.configure();
                    debug!(session_id = %self.pipeline.session_id, "Live audio parameters updated");
                    Ok(())
                }
                Err(e) => {
                    let e = FrameError::from(e);
                    self.pipeline.writer.send_error(e.code(), &e.to_string()).await
                }
            },
            MessageType::AudioOnlyRequest => {
                let last = frame.is_final();
                self.feed_live(frame.payload, last);
                Ok(())
            }
            other => {
                self.pipeline
                    .writer
                    .send_error(400, &format!("Unsupported client message type {:?}", other))
                    .await
            }
        }
    }

    fn spawn_batch_recognition(&self, audio: Vec<u8>) {
        tokio::spawn(self.pipeline.clone().recognize_batch(
            audio,
            self.config.clone(),
            self.utterances.clone(),
        ));
    }

    /// Append audio to the live stream, starting one if needed. `last` ends it.
    fn feed_live(&mut self, audio: Vec<u8>, last: bool) {
        let running = self.live_audio.as_ref().is_some_and(|tx| !tx.is_closed());
        if !running {
            if audio.is_empty() && last {
                return;
            }
            let (tx, rx) = mpsc::channel(self.pipeline.deps.settings.audio_queue_capacity);
            tokio::spawn(self.pipeline.clone().run_live(
                rx,
                self.config.clone(),
                self.utterances.clone(),
            ));
            self.live_audio = Some(tx);
        }

        if !audio.is_empty() {
            if let Some(tx) = &self.live_audio {
                if let Err(TrySendError::Full(chunk)) = tx.try_send(audio) {
                    warn!(
                        session_id = %self.pipeline.session_id,
                        bytes = chunk.len(),
                        "Live audio queue full, dropping frame"
                    );
                }
            }
        }

        if last {
            self.live_audio = None;
        }
    }

    async fn shutdown(mut self) {
        self.pipeline.cancel.cancel();
        self.live_audio = None;
        self.pipeline.state.close();
        self.pipeline.writer.close().await;
        info!(session_id = %self.pipeline.session_id, "Session closed");
    }
}

/// Audio stream over a receiver shared between fallback attempts, so a
/// candidate that fails to start does not take the audio with it.
fn shared_audio(rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) -> BoxStream<'static, Vec<u8>> {
    Box::pin(stream::unfold(rx, |rx| async move {
        let next = rx.lock().await.recv().await;
        next.map(|chunk| (chunk, rx))
    }))
}

impl Pipeline {
    /// Queue an utterance for the text stage without waiting.
    fn forward(&self, utterances: &mpsc::Sender<Utterance>, text: String, config: Arc<SessionConfig>) {
        match utterances.try_send(Utterance { text, config }) {
            Ok(()) => {}
            Err(TrySendError::Full(utterance)) => {
                warn!(
                    session_id = %self.session_id,
                    text = %utterance.text,
                    "Text queue full, dropping utterance"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Text stage stopped, utterance ignored");
            }
        }
    }

    async fn recognize_batch(
        self: Arc<Self>,
        audio: Vec<u8>,
        config: Arc<SessionConfig>,
        utterances: mpsc::Sender<Utterance>,
    ) {
        let Some(_work) = self.state.begin_work() else {
            return;
        };
        let bytes = audio.len();
        if self
            .writer
            .send(OutboundFrame::status("processing_audio", "Recognizing speech"))
            .await
            .is_err()
        {
            return;
        }

        let timeout = Duration::from_secs(self.deps.settings.asr_timeout_secs);
        let audio = Arc::new(audio);
        let result = config
            .asr_chain()
            .run(
                |name| self.deps.registry.get_asr(name),
                |asr| {
                    let audio = audio.to_vec();
                    let cancel = self.cancel.clone();
                    async move {
                        match tokio::time::timeout(timeout, asr.recognize_batch(audio, cancel)).await {
                            Ok(result) => result,
                            Err(_) => Err(ProviderError::Timeout {
                                provider: asr.name().to_string(),
                                seconds: timeout.as_secs(),
                            }),
                        }
                    }
                },
            )
            .await;

        let sent = match result {
            Ok((provider, text)) => {
                let text = text.trim().to_string();
                info!(session_id = %self.session_id, provider = %provider, bytes, text = %text, "Speech recognized");
                if text.is_empty() {
                    self.writer.send_error(400, "No speech recognized in audio").await
                } else {
                    let transcript = Transcript {
                        text: text.clone(),
                        is_final: true,
                        confidence: DEFAULT_TRANSCRIPT_CONFIDENCE,
                    };
                    let sent = self.writer.send(OutboundFrame::transcript(&transcript)).await;
                    if sent.is_ok() {
                        self.forward(&utterances, text, config);
                    }
                    sent
                }
            }
            Err(ProviderError::Cancelled) => Ok(()),
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Speech recognition failed");
                self.writer
                    .send_error(e.code(), &format!("Speech recognition failed: {}", e))
                    .await
            }
        };
        if let Err(e) = sent {
            debug!(session_id = %self.session_id, error = %e, "Recognition result not delivered");
        }
    }

    async fn run_live(
        self: Arc<Self>,
        audio: mpsc::Receiver<Vec<u8>>,
        config: Arc<SessionConfig>,
        utterances: mpsc::Sender<Utterance>,
    ) {
        let Some(_work) = self.state.begin_work() else {
            return;
        };
        let audio = Arc::new(Mutex::new(audio));

        let started = config
            .asr_chain()
            .run(
                |name| self.deps.registry.get_asr(name),
                |asr| {
                    let audio = shared_audio(audio.clone());
                    let cancel = self.cancel.clone();
                    async move { asr.stream_recognize(audio, cancel).await }
                },
            )
            .await;

        let (provider, mut transcripts) = match started {
            Ok(started) => started,
            Err(ProviderError::Cancelled) => return,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Live recognition could not start");
                let _ = self
                    .writer
                    .send_error(e.code(), &format!("Speech recognition failed: {}", e))
                    .await;
                return;
            }
        };
        info!(session_id = %self.session_id, provider = %provider, "Live recognition started");

        while let Some(item) = self.cancel.run_until_cancelled(transcripts.next()).await.flatten() {
            match item {
                Ok(transcript) => {
                    if self.writer.send(OutboundFrame::transcript(&transcript)).await.is_err() {
                        return;
                    }
                    let text = transcript.text.trim();
                    if transcript.is_final && !text.is_empty() {
                        self.forward(&utterances, text.to_string(), config.clone());
                    }
                }
                Err(ProviderError::Cancelled) => return,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Live recognition failed");
                    let _ = self
                        .writer
                        .send_error(e.code(), &format!("Speech recognition failed: {}", e))
                        .await;
                    return;
                }
            }
        }
        debug!(session_id = %self.session_id, "Live recognition finished");
    }

    /// Single worker: turns run strictly one after another.
    async fn run_text_stage(self: Arc<Self>, mut utterances: mpsc::Receiver<Utterance>) {
        while let Some(Some(utterance)) = self.cancel.run_until_cancelled(utterances.recv()).await {
            if let Err(e) = self.run_turn(utterance).await {
                debug!(session_id = %self.session_id, error = %e, "Text stage stopping");
                break;
            }
        }
    }

    /// Moderation gate. `Ok(false)` means the utterance must be dropped.
    async fn moderate(&self, text: &str, config: &SessionConfig) -> Result<bool, TransportError> {
        let Some(name) = config.moderation() else {
            return Ok(true);
        };

        let provider = match self.deps.registry.get_moderation(name) {
            Ok(provider) => provider,
            Err(e) => {
                self.writer
                    .send_error(e.code(), &format!("Moderation unavailable: {}", e))
                    .await?;
                return Ok(false);
            }
        };

        match provider.check_text(text, self.cancel.clone()).await {
            Ok(result) => match result.action {
                ModerationAction::Block => {
                    info!(session_id = %self.session_id, labels = ?result.labels, "Utterance blocked");
                    self.writer
                        .send_error(BLOCKED_CONTENT_CODE, "Content blocked by moderation")
                        .await?;
                    Ok(false)
                }
                ModerationAction::Warn => {
                    self.writer
                        .send(OutboundFrame::status("moderation_warning", &result.labels.join(",")))
                        .await?;
                    Ok(true)
                }
                ModerationAction::Rewrite | ModerationAction::Pass => Ok(true),
            },
            Err(ProviderError::Cancelled) => Ok(false),
            Err(e) => {
                self.writer
                    .send_error(e.code(), &format!("Moderation check failed: {}", e))
                    .await?;
                Ok(false)
            }
        }
    }

    /// One turn: moderation, LLM stream, sentence synthesis, completion.
    async fn run_turn(&self, utterance: Utterance) -> Result<(), TransportError> {
        let Utterance { text, config } = utterance;
        let Some(_work) = self.state.begin_work() else {
            return Ok(());
        };

        if !self.moderate(&text, &config).await? {
            return Ok(());
        }

        self.writer
            .send(OutboundFrame::status("processing_llm", "Generating response"))
            .await?;

        let role = self.deps.roles.resolve(config.role());
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = &role.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.push(ChatMessage::user(text));
        let request = ChatRequest {
            model: config.llm_model(),
            messages,
            ..Default::default()
        };

        let started = config
            .llm_chain()
            .run(
                |name| self.deps.registry.get_llm(name),
                |llm| {
                    let request = request.clone();
                    let cancel = self.cancel.clone();
                    async move { llm.chat_stream(request, cancel).await }
                },
            )
            .await;

        let (provider, mut deltas) = match started {
            Ok(started) => started,
            Err(ProviderError::Cancelled) => return Ok(()),
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "LLM unavailable");
                return self
                    .writer
                    .send_error(e.code(), &format!("LLM processing failed: {}", e))
                    .await;
            }
        };

        let plan = SynthesisPlan {
            chain: config.tts_chain(),
            options: config.tts_options(&self.deps.settings, role.voice.as_deref()),
        };
        let mut sentences = self.synthesizer.start(
            plan,
            self.deps.settings.sentence_queue_capacity,
            self.cancel.clone(),
        );
        let mut segmenter = SentenceSegmenter::new();
        let mut accumulated = String::new();
        let mut usage = None;
        let mut failure = None;

        while let Some(item) = self.cancel.run_until_cancelled(deltas.next()).await.flatten() {
            match item {
                Ok(delta) => {
                    if delta.usage.is_some() {
                        usage = delta.usage;
                    }
                    if !delta.text.is_empty() {
                        let is_first = accumulated.is_empty();
                        accumulated.push_str(&delta.text);
                        self.writer
                            .send(OutboundFrame::text_delta(&delta.text, &accumulated, is_first, false))
                            .await?;
                        for sentence in segmenter.push(&delta.text) {
                            sentences.submit(sentence);
                        }
                    }
                    // A finish reason ends the turn even if the vendor keeps the stream open.
                    if delta.is_terminal() {
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(deltas);

        if self.cancel.is_cancelled() {
            sentences.finish().await;
            return Ok(());
        }

        if let Some(e) = failure {
            warn!(session_id = %self.session_id, provider = %provider, error = %e, "LLM stream failed mid-turn");
            self.writer
                .send_error(e.code(), &format!("LLM stream failed: {}", e))
                .await?;
            sentences.finish().await;
            return Ok(());
        }

        if let Some(rest) = segmenter.finish() {
            sentences.submit(rest);
        }
        let summary = sentences.finish().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        info!(
            session_id = %self.session_id,
            provider = %provider,
            chars = accumulated.chars().count(),
            sentences = summary.sentences,
            audio_chunks = summary.chunks,
            failed = summary.failed,
            dropped = summary.dropped,
            "Turn complete"
        );
        self.writer
            .send(OutboundFrame::turn_complete(&accumulated, usage.as_ref()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Compression;
    use crate::protocol::OutboundKind;
    use crate::providers::testing::{
        capture_sink, collect_until, drain_for, FailingSink, ScriptedAsr, ScriptedLlm,
        ScriptedModerator, ScriptedTts,
    };
    use crate::providers::Usage;
    use crate::session::SessionState;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    struct Harness {
        inbound: mpsc::Sender<InboundMessage>,
        frames: UnboundedReceiver<OutboundFrame>,
        handle: JoinHandle<()>,
        state: SessionStateCell,
    }

    impl Harness {
        async fn start(registry: ProviderRegistry) -> Self {
            let deps = SessionDeps {
                registry: Arc::new(registry),
                roles: Arc::new(RoleCatalog::builtin()),
                settings: SessionSettings::default(),
            };
            let (sink, mut frames) = capture_sink();
            let session = Session::new("test-session", deps, sink, CancelToken::new());
            let state = session.state();
            let (inbound, rx) = mpsc::channel(16);
            let handle = tokio::spawn(session.run(rx));

            let welcome = collect_until(&mut frames, OutboundKind::Welcome).await;
            assert_eq!(welcome.len(), 1);
            Self { inbound, frames, handle, state }
        }

        async fn send_json(&self, value: Value) {
            self.inbound
                .send(InboundMessage::Text(value.to_string()))
                .await
                .unwrap();
        }

        async fn send_binary(&self, bytes: Vec<u8>) {
            self.inbound.send(InboundMessage::Binary(bytes)).await.unwrap();
        }

        async fn until(&mut self, kind: OutboundKind) -> Vec<OutboundFrame> {
            collect_until(&mut self.frames, kind).await
        }
    }

    fn registry_with(llm: ScriptedLlm, tts: Arc<ScriptedTts>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register_asr(Arc::new(ScriptedAsr::new("qiniu", "今天天气怎么样？")));
        registry.register_llm(Arc::new(llm));
        registry.register_tts(tts);
        registry
    }

    fn default_registry() -> ProviderRegistry {
        registry_with(
            ScriptedLlm::new("qiniu", &["你好", "。今天", "很好！", "再见"]),
            Arc::new(ScriptedTts::new("qiniu")),
        )
    }

    fn kinds(frames: &[OutboundFrame]) -> Vec<OutboundKind> {
        frames.iter().map(|f| f.kind).collect()
    }

    fn position(frames: &[OutboundFrame], kind: OutboundKind) -> usize {
        frames.iter().position(|f| f.kind == kind).unwrap()
    }

    #[tokio::test]
    async fn test_text_turn_streams_text_then_audio() {
        let mut harness = Harness::start(default_registry()).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "你好"}}))
            .await;

        let frames = harness.until(OutboundKind::TurnComplete).await;

        assert_eq!(frames[0].kind, OutboundKind::Status);
        assert_eq!(frames[0].content["status"], "processing_llm");

        let responses: Vec<&OutboundFrame> =
            frames.iter().filter(|f| f.kind == OutboundKind::TextDelta).collect();
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0].content["is_first"], true);
        assert_eq!(responses[3].content["accumulated"], "你好。今天很好！再见");

        let audio: Vec<&OutboundFrame> =
            frames.iter().filter(|f| f.kind == OutboundKind::Audio).collect();
        let sequences: Vec<u64> = audio.iter().map(|f| f.seq.unwrap()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
        let texts: Vec<&str> = audio.iter().map(|f| f.content["text"].as_str().unwrap()).collect();
        assert_eq!(texts, vec!["你好。", "你好。", "今天很好！", "今天很好！", "再见", "再见"]);

        let done = frames.last().unwrap();
        assert_eq!(done.content["text"], "你好。今天很好！再见");
        assert!(done.content.get("usage").is_none());
    }

    #[tokio::test]
    async fn test_turn_complete_reports_usage() {
        let usage = Usage { prompt_tokens: 5, completion_tokens: 3, total_tokens: 8 };
        let registry = registry_with(
            ScriptedLlm::new("qiniu", &["好的。"]).with_usage(usage),
            Arc::new(ScriptedTts::new("qiniu")),
        );
        let mut harness = Harness::start(registry).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hi"}}))
            .await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        assert_eq!(frames.last().unwrap().content["usage"]["total_tokens"], 8);
    }

    #[tokio::test]
    async fn test_binary_audio_runs_recognition_first() {
        let mut harness = Harness::start(default_registry()).await;
        harness.send_binary(b"RIFF fake wav bytes".to_vec()).await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        assert_eq!(frames[0].content["status"], "processing_audio");

        let transcript = position(&frames, OutboundKind::Transcript);
        assert_eq!(frames[transcript].content["text"], "今天天气怎么样？");
        assert_eq!(frames[transcript].content["is_final"], true);
        assert!(transcript < position(&frames, OutboundKind::TextDelta));
        assert!(transcript < position(&frames, OutboundKind::Audio));
    }

    #[tokio::test]
    async fn test_json_audio_frame_uses_fallback_asr() {
        let mut registry = default_registry();
        registry.register_asr(Arc::new(ScriptedAsr::failing("qiniu")));
        registry.register_asr(Arc::new(ScriptedAsr::new("iflytek", "备用识别。")));
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "audio", "content": {"audio_data": [1, 2, 3, 4]}}))
            .await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        let transcript = &frames[position(&frames, OutboundKind::Transcript)];
        assert_eq!(transcript.content["text"], "备用识别。");
        assert!(!kinds(&frames).contains(&OutboundKind::Error));
    }

    #[tokio::test]
    async fn test_all_llm_candidates_fail_sends_one_error() {
        let registry = registry_with(ScriptedLlm::failing("qiniu"), Arc::new(ScriptedTts::new("qiniu")));
        let mut harness = Harness::start(registry).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;

        let mut frames = harness.until(OutboundKind::Error).await;
        frames.extend(drain_for(&mut harness.frames, Duration::from_millis(100)).await);

        let errors: Vec<&OutboundFrame> =
            frames.iter().filter(|f| f.kind == OutboundKind::Error).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].content["message"]
            .as_str()
            .unwrap()
            .contains("LLM processing failed"));
        assert!(!kinds(&frames).contains(&OutboundKind::TurnComplete));
        assert!(!kinds(&frames).contains(&OutboundKind::TextDelta));
    }

    #[tokio::test]
    async fn test_llm_mid_stream_failure_aborts_turn() {
        let registry = registry_with(
            ScriptedLlm::new("qiniu", &["第一句。", "第二句。"]).failing_after(1),
            Arc::new(ScriptedTts::new("qiniu")),
        );
        let mut harness = Harness::start(registry).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;

        let mut frames = harness.until(OutboundKind::Error).await;
        frames.extend(drain_for(&mut harness.frames, Duration::from_millis(100)).await);

        let error = &frames[position(&frames, OutboundKind::Error)];
        assert_eq!(error.content["code"], 502);
        assert_eq!(
            frames.iter().filter(|f| f.kind == OutboundKind::TextDelta).count(),
            1
        );
        assert!(!kinds(&frames).contains(&OutboundKind::TurnComplete));
    }

    #[tokio::test]
    async fn test_finish_reason_ends_turn_while_stream_stays_open() {
        let registry = registry_with(
            ScriptedLlm::new("qiniu", &["你", "好", "！"]).holding_open(),
            Arc::new(ScriptedTts::new("qiniu")),
        );
        let mut harness = Harness::start(registry).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        assert_eq!(frames.last().unwrap().content["text"], "你好！");
        assert_eq!(
            frames.iter().filter(|f| f.kind == OutboundKind::Audio).count(),
            2
        );

        // The text stage is free for the next utterance.
        harness
            .send_json(json!({"type": "text", "content": {"content": "again"}}))
            .await;
        let next = harness.until(OutboundKind::TurnComplete).await;
        assert_eq!(next.last().unwrap().content["text"], "你好！");
    }

    #[tokio::test]
    async fn test_all_asr_candidates_fail_sends_one_error() {
        let mut registry = default_registry();
        registry.register_asr(Arc::new(ScriptedAsr::failing("qiniu")));
        registry.register_asr(Arc::new(ScriptedAsr::failing("iflytek")));
        let mut harness = Harness::start(registry).await;
        harness.send_binary(b"RIFF fake wav bytes".to_vec()).await;

        let mut frames = harness.until(OutboundKind::Error).await;
        frames.extend(drain_for(&mut harness.frames, Duration::from_millis(100)).await);

        let errors: Vec<&OutboundFrame> =
            frames.iter().filter(|f| f.kind == OutboundKind::Error).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].content["message"]
            .as_str()
            .unwrap()
            .contains("Speech recognition failed"));
        assert!(!kinds(&frames).contains(&OutboundKind::Transcript));
        assert!(!kinds(&frames).contains(&OutboundKind::TextDelta));
    }

    #[tokio::test]
    async fn test_config_frame_is_acknowledged_and_applied() {
        let tts = Arc::new(ScriptedTts::new("qiniu"));
        let registry = registry_with(ScriptedLlm::new("qiniu", &["好。"]), tts.clone());
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "config", "content": {"voice": "custom_voice", "speed": 1.25}}))
            .await;
        let ack = harness.until(OutboundKind::ConfigUpdated).await;
        assert_eq!(ack[0].content["config"]["voice"], "custom_voice");
        assert_eq!(ack[0].content["providers"]["llm"], "qiniu");
        assert_eq!(harness.state.get(), SessionState::Configured);

        harness
            .send_json(json!({"type": "text", "content": {"content": "hi"}}))
            .await;
        harness.until(OutboundKind::TurnComplete).await;

        let options = tts.options.lock().unwrap().last().cloned().unwrap();
        assert_eq!(options.voice, "custom_voice");
        assert_eq!(options.speed, 1.25);
    }

    #[tokio::test]
    async fn test_role_sets_system_prompt_and_voice() {
        let tts = Arc::new(ScriptedTts::new("qiniu"));
        let llm = Arc::new(ScriptedLlm::new("qiniu", &["Sure."]));
        let mut registry = registry_with(ScriptedLlm::new("unused", &[]), tts.clone());
        registry.register_llm(llm.clone());
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "config", "content": {"role": "english_tutor"}}))
            .await;
        harness.until(OutboundKind::ConfigUpdated).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;
        harness.until(OutboundKind::TurnComplete).await;

        let request = llm.last_request().unwrap();
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[0].content.contains("English tutor"));
        assert_eq!(request.messages[1].content, "hello");

        let options = tts.options.lock().unwrap().last().cloned().unwrap();
        assert_eq!(options.voice, "qiniu_en_female_ysyyn");
    }

    #[tokio::test]
    async fn test_moderation_block_drops_utterance() {
        let llm = Arc::new(ScriptedLlm::new("qiniu", &["never"]));
        let mut registry = registry_with(ScriptedLlm::new("unused", &[]), Arc::new(ScriptedTts::new("qiniu")));
        registry.register_llm(llm.clone());
        registry.register_moderation(Arc::new(ScriptedModerator::new("guard", ModerationAction::Block)));
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "config", "content": {"moderationProvider": "guard"}}))
            .await;
        harness.until(OutboundKind::ConfigUpdated).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "bad words"}}))
            .await;

        let frames = harness.until(OutboundKind::Error).await;
        assert_eq!(frames.last().unwrap().content["code"], BLOCKED_CONTENT_CODE);
        assert!(llm.last_request().is_none());
    }

    #[tokio::test]
    async fn test_moderation_warn_continues() {
        let mut registry = default_registry();
        registry.register_moderation(Arc::new(ScriptedModerator::new("guard", ModerationAction::Warn)));
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "config", "content": {"moderationProvider": "guard"}}))
            .await;
        harness.until(OutboundKind::ConfigUpdated).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hmm"}}))
            .await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        assert_eq!(frames[0].content["status"], "moderation_warning");
        assert_eq!(frames[0].content["message"], "scripted");
    }

    #[tokio::test]
    async fn test_unknown_moderation_provider_fails_closed() {
        let llm = Arc::new(ScriptedLlm::new("qiniu", &["never"]));
        let mut registry = registry_with(ScriptedLlm::new("unused", &[]), Arc::new(ScriptedTts::new("qiniu")));
        registry.register_llm(llm.clone());
        let mut harness = Harness::start(registry).await;

        harness
            .send_json(json!({"type": "config", "content": {"moderationProvider": "ghost"}}))
            .await;
        harness.until(OutboundKind::ConfigUpdated).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;

        let frames = harness.until(OutboundKind::Error).await;
        assert_eq!(frames.last().unwrap().content["code"], 404);
        assert!(llm.last_request().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_session_open() {
        let mut harness = Harness::start(default_registry()).await;

        harness
            .inbound
            .send(InboundMessage::Text("{not json".to_string()))
            .await
            .unwrap();
        let error = harness.until(OutboundKind::Error).await;
        assert_eq!(error.last().unwrap().content["code"], 400);

        harness.send_json(json!({"type": "dance"})).await;
        harness.until(OutboundKind::Error).await;

        // Truncated wire frame: header says 500 payload bytes, 10 present.
        let mut truncated = vec![0x11, 0x20, 0x00, 0x00];
        truncated.extend_from_slice(&500u32.to_be_bytes());
        truncated.extend_from_slice(&[0u8; 10]);
        harness.send_binary(truncated).await;
        let error = harness.until(OutboundKind::Error).await;
        assert!(error.last().unwrap().content["message"]
            .as_str()
            .unwrap()
            .contains("Malformed wire frame"));

        harness
            .send_json(json!({"type": "text", "content": {"content": "still here"}}))
            .await;
        harness.until(OutboundKind::TurnComplete).await;
    }

    #[tokio::test]
    async fn test_live_recognition_over_wire_frames() {
        let mut harness = Harness::start(default_registry()).await;

        let start = WireFrame::json(
            MessageType::FullClientRequest,
            &json!({"audio": {"format": "pcm", "sample_rate": 16000}}),
            Compression::Gzip,
        )
        .unwrap()
        .with_sequence(1)
        .encode()
        .unwrap();
        harness.send_binary(start).await;

        let chunk = WireFrame::audio(vec![1; 320], Compression::None)
            .with_sequence(2)
            .encode()
            .unwrap();
        harness.send_binary(chunk).await;

        let last = WireFrame::audio(vec![2; 320], Compression::Gzip)
            .with_sequence(-3)
            .mark_final()
            .encode()
            .unwrap();
        harness.send_binary(last).await;

        let frames = harness.until(OutboundKind::TurnComplete).await;
        let transcripts: Vec<&OutboundFrame> =
            frames.iter().filter(|f| f.kind == OutboundKind::Transcript).collect();
        assert_eq!(transcripts.len(), 2);
        assert_eq!(transcripts[0].content["is_final"], false);
        assert_eq!(transcripts[1].content["is_final"], true);
        assert_eq!(transcripts[1].content["text"], "今天天气怎么样？");
        assert!(kinds(&frames).contains(&OutboundKind::Audio));
    }

    #[tokio::test]
    async fn test_sequence_spans_turns() {
        let mut harness = Harness::start(default_registry()).await;

        harness
            .send_json(json!({"type": "text", "content": {"content": "one"}}))
            .await;
        let first = harness.until(OutboundKind::TurnComplete).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "two"}}))
            .await;
        let second = harness.until(OutboundKind::TurnComplete).await;

        let last_of_first = first.iter().filter_map(|f| f.seq).max().unwrap();
        let first_of_second = second.iter().filter_map(|f| f.seq).min().unwrap();
        assert_eq!(first_of_second, last_of_first + 1);
    }

    #[tokio::test]
    async fn test_closing_connection_cancels_turn() {
        let registry = registry_with(
            ScriptedLlm::new("qiniu", &["slow", "reply."]).with_delay(Duration::from_secs(10)),
            Arc::new(ScriptedTts::new("qiniu")),
        );
        let mut harness = Harness::start(registry).await;
        harness
            .send_json(json!({"type": "text", "content": {"content": "hello"}}))
            .await;
        harness.until(OutboundKind::Status).await;

        drop(harness.inbound);
        tokio::time::timeout(Duration::from_secs(1), harness.handle)
            .await
            .expect("session ends promptly")
            .unwrap();
        assert_eq!(harness.state.get(), SessionState::Closed);

        let rest = drain_for(&mut harness.frames, Duration::from_millis(100)).await;
        assert!(!kinds(&rest).contains(&OutboundKind::TurnComplete));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_session() {
        let deps = SessionDeps {
            registry: Arc::new(default_registry()),
            roles: Arc::new(RoleCatalog::builtin()),
            settings: SessionSettings::default(),
        };
        let cancel = CancelToken::new();
        let session = Session::new("broken", deps, Box::new(FailingSink), cancel.clone());
        let (_inbound, rx) = mpsc::channel(4);

        tokio::time::timeout(Duration::from_secs(1), session.run(rx))
            .await
            .expect("session ends when the welcome cannot be written");
        assert!(cancel.is_cancelled());
    }
}
