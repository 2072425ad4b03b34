use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{self, BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::{Envelope, IFLYTEK, STATUS_LAST};
use crate::cancel::CancelToken;
use crate::config::IflytekConfig;
use crate::providers::credentials::CredentialSource;
use crate::providers::socket::{connect_ws, VendorSocket};
use crate::providers::{
    AsrProvider, ProviderError, ProviderResult, ProviderStream, Transcript,
    DEFAULT_TRANSCRIPT_CONFIDENCE,
};

const TRANSCRIPT_BUFFER: usize = 16;
/// Upload size for one-shot recordings; the service caps a single frame.
const BATCH_FRAME_BYTES: usize = 8000;
const AUDIO_FORMAT: &str = "audio/L16;rate=16000";

const STATUS_FIRST: u8 = 0;
const STATUS_CONTINUE: u8 = 1;

/// Dictation over the iFlytek IAT WebSocket API.
pub struct IflytekAsr {
    ws_url: String,
    app_id: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

impl IflytekAsr {
    pub fn new(
        config: &IflytekConfig,
        app_id: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            ws_url: config.asr_ws_url.clone(),
            app_id: app_id.into(),
            credentials,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct AudioFrame<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    common: Option<Common<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    business: Option<Business>,
    data: AudioData,
}

#[derive(Serialize)]
struct Common<'a> {
    app_id: &'a str,
}

#[derive(Serialize)]
struct Business {
    language: &'static str,
    domain: &'static str,
    accent: &'static str,
    /// Trailing silence in ms before the service ends the utterance.
    vad_eos: u32,
}

#[derive(Serialize)]
struct AudioData {
    status: u8,
    format: &'static str,
    encoding: &'static str,
    audio: String,
}

/// One upload frame. The first frame carries the session parameters.
fn audio_frame(app_id: &str, status: u8, audio: &[u8]) -> ProviderResult<Message> {
    let first = status == STATUS_FIRST;
    let frame = AudioFrame {
        common: first.then_some(Common { app_id }),
        business: first.then_some(Business {
            language: "zh_cn",
            domain: "iat",
            accent: "mandarin",
            vad_eos: 10_000,
        }),
        data: AudioData {
            status,
            format: AUDIO_FORMAT,
            encoding: "raw",
            audio: BASE64.encode(audio),
        },
    };
    let body = serde_json::to_string(&frame).map_err(|e| ProviderError::invalid(IFLYTEK, e))?;
    Ok(Message::Text(body))
}

async fn send_frame(
    sink: &mut SplitSink<VendorSocket, Message>,
    frame: ProviderResult<Message>,
) -> ProviderResult<()> {
    sink.send(frame?)
        .await
        .map_err(|e| ProviderError::request(IFLYTEK, e))
}

#[derive(Deserialize, Debug)]
struct RecognitionData {
    #[serde(default)]
    status: u8,
    result: Option<RecognitionResult>,
}

#[derive(Deserialize, Debug)]
struct RecognitionResult {
    #[serde(default)]
    ws: Vec<Word>,
    /// Set on the last result of the session.
    #[serde(default)]
    ls: bool,
}

#[derive(Deserialize, Debug)]
struct Word {
    #[serde(default)]
    cw: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    #[serde(default)]
    w: String,
}

impl RecognitionResult {
    fn text(&self) -> String {
        self.ws
            .iter()
            .flat_map(|word| word.cw.first())
            .map(|candidate| candidate.w.as_str())
            .collect()
    }
}

/// Results arrive as consecutive pieces. Interim transcripts report the text
/// so far; the final one is emitted once.
#[derive(Default)]
struct TranscriptAssembler {
    text: String,
    finished: bool,
}

impl TranscriptAssembler {
    fn on_payload(&mut self, payload: &[u8]) -> ProviderResult<(Option<Transcript>, bool)> {
        let envelope: Envelope<RecognitionData> = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable recognition response");
                return Ok((None, false));
            }
        };
        let Some(data) = envelope.into_data()? else {
            return Ok((None, false));
        };

        let mut last = data.status == STATUS_LAST;
        let mut grew = false;
        if let Some(result) = &data.result {
            let piece = result.text();
            grew = !piece.is_empty();
            self.text.push_str(&piece);
            last |= result.ls;
        }

        if last {
            return Ok((self.finish(), true));
        }
        let interim = grew.then(|| Transcript {
            text: self.text.clone(),
            is_final: false,
            confidence: DEFAULT_TRANSCRIPT_CONFIDENCE,
        });
        Ok((interim, false))
    }

    /// Handle one socket message. Returns the transcript to emit, if any, and
    /// whether the stream is over.
    fn on_message(
        &mut self,
        message: Option<Result<Message, WsError>>,
    ) -> ProviderResult<(Option<Transcript>, bool)> {
        match message {
            Some(Ok(Message::Text(text))) => self.on_payload(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => self.on_payload(&bytes),
            Some(Ok(Message::Close(_))) | None => Ok((self.finish(), true)),
            Some(Ok(_)) => Ok((None, false)),
            Some(Err(e)) => Err(ProviderError::request(IFLYTEK, e)),
        }
    }

    fn finish(&mut self) -> Option<Transcript> {
        if self.finished || self.text.is_empty() {
            self.finished = true;
            return None;
        }
        self.finished = true;
        Some(Transcript {
            text: std::mem::take(&mut self.text),
            is_final: true,
            confidence: DEFAULT_TRANSCRIPT_CONFIDENCE,
        })
    }
}

#[async_trait]
impl AsrProvider for IflytekAsr {
    fn name(&self) -> &str {
        IFLYTEK
    }

    async fn stream_recognize(
        &self,
        audio: BoxStream<'static, Vec<u8>>,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<Transcript>> {
        let endpoint = self.credentials.sign(&self.ws_url)?;
        let socket = cancel
            .run_until_cancelled(connect_ws(IFLYTEK, endpoint, self.timeout))
            .await
            .unwrap_or(Err(ProviderError::Cancelled))?;
        let (mut sink, mut source) = socket.split();

        let (tx, rx) = mpsc::channel(TRANSCRIPT_BUFFER);

        let app_id = self.app_id.clone();
        let writer_cancel = cancel.clone();
        let writer_tx = tx.clone();
        tokio::spawn(async move {
            let mut audio = audio;
            let mut frames = 0usize;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => return,
                    chunk = audio.next() => chunk,
                };

                let sent = match next {
                    Some(chunk) => {
                        let status = if frames == 0 { STATUS_FIRST } else { STATUS_CONTINUE };
                        frames += 1;
                        send_frame(&mut sink, audio_frame(&app_id, status, &chunk)).await
                    }
                    None => {
                        // The session must open with a first frame even for empty input.
                        let opened = if frames == 0 {
                            send_frame(&mut sink, audio_frame(&app_id, STATUS_FIRST, &[])).await
                        } else {
                            Ok(())
                        };
                        let sent = match opened {
                            Ok(()) => send_frame(&mut sink, audio_frame(&app_id, STATUS_LAST, &[])).await,
                            Err(e) => Err(e),
                        };
                        debug!(frames, "Audio upload finished");
                        if let Err(e) = sent {
                            let _ = writer_tx.send(Err(e)).await;
                        }
                        return;
                    }
                };

                if let Err(e) = sent {
                    let _ = writer_tx.send(Err(e)).await;
                    return;
                }
            }
        });

        tokio::spawn(async move {
            let mut assembler = TranscriptAssembler::default();
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.try_send(Err(ProviderError::Cancelled));
                        return;
                    }
                    message = source.next() => message,
                };

                match assembler.on_message(message) {
                    Ok((transcript, last)) => {
                        if let Some(transcript) = transcript {
                            if tx.send(Ok(transcript)).await.is_err() {
                                return;
                            }
                        }
                        if last {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Recognition stream failed");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn recognize_batch(&self, audio: Vec<u8>, cancel: CancelToken) -> ProviderResult<String> {
        let bytes = audio.len();
        let frames: Vec<Vec<u8>> = audio.chunks(BATCH_FRAME_BYTES).map(<[u8]>::to_vec).collect();
        let mut transcripts = self
            .stream_recognize(Box::pin(stream::iter(frames)), cancel)
            .await?;

        let collect = async {
            let mut text = String::new();
            while let Some(item) = transcripts.next().await {
                let transcript = item?;
                if !transcript.text.is_empty() {
                    text = transcript.text;
                }
                if transcript.is_final {
                    break;
                }
            }
            Ok::<_, ProviderError>(text)
        };

        let text = tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| ProviderError::Timeout {
                provider: IFLYTEK.to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        debug!(bytes, chars = text.chars().count(), "Batch recognition finished");
        Ok(text)
    }
}
