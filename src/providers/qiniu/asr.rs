use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use uuid::Uuid;

use super::QINIU;
use crate::cancel::CancelToken;
use crate::config::QiniuConfig;
use crate::protocol::codec::{Compression, MessageType, WireFrame};
use crate::providers::credentials::CredentialSource;
use crate::providers::socket::{connect_ws, VendorSocket};
use crate::providers::{
    AsrProvider, ProviderError, ProviderResult, ProviderStream, Transcript,
    DEFAULT_TRANSCRIPT_CONFIDENCE,
};

const TRANSCRIPT_BUFFER: usize = 16;
/// Sequence 1 is the session request; audio starts after it.
const FIRST_AUDIO_SEQUENCE: i32 = 2;

/// Streaming recognition over the binary frame protocol.
pub struct QiniuAsr {
    ws_url: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

impl QiniuAsr {
    pub fn new(config: &QiniuConfig, credentials: Arc<dyn CredentialSource>, timeout: Duration) -> Self {
        Self {
            ws_url: config.asr_ws_url.clone(),
            credentials,
            timeout,
        }
    }
}

/// FULL_CLIENT_REQUEST describing 16 kHz 16-bit mono PCM.
fn session_request(uid: &str) -> ProviderResult<Vec<u8>> {
    let request = json!({
        "user": { "uid": uid },
        "audio": {
            "format": "pcm",
            "sample_rate": 16000,
            "bits": 16,
            "channel": 1,
            "codec": "raw",
        },
        "request": {
            "model_name": "asr",
            "enable_punc": true,
        },
    });
    Ok(WireFrame::json(MessageType::FullClientRequest, &request, Compression::Gzip)?
        .with_sequence(1)
        .encode()?)
}

/// AUDIO_ONLY_REQUEST; the last one carries the final flag and a negated sequence.
fn audio_request(audio: Vec<u8>, sequence: i32, last: bool) -> ProviderResult<Vec<u8>> {
    let frame = if last {
        WireFrame::audio(audio, Compression::Gzip)
            .with_sequence(-sequence)
            .mark_final()
    } else {
        WireFrame::audio(audio, Compression::Gzip).with_sequence(sequence)
    };
    Ok(frame.encode()?)
}

async fn send_binary(
    sink: &mut SplitSink<VendorSocket, Message>,
    bytes: ProviderResult<Vec<u8>>,
) -> ProviderResult<()> {
    sink.send(Message::Binary(bytes?))
        .await
        .map_err(|e| ProviderError::request(QINIU, e))
}

fn response_text(value: &Value) -> Option<&str> {
    value
        .pointer("/result/text")
        .or_else(|| value.pointer("/payload_msg/result/text"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

/// Turns server frames into transcripts. Interim results are cumulative, so
/// the final transcript falls back to the latest interim text when the
/// server's last frame carries none.
#[derive(Default)]
struct TranscriptAssembler {
    latest: String,
    finished: bool,
}

impl TranscriptAssembler {
    fn on_frame(&mut self, frame: &WireFrame) -> ProviderResult<Option<Transcript>> {
        match frame.message_type {
            MessageType::FullServerResponse => {
                let value: Value = serde_json::from_slice(&frame.payload)
                    .map_err(|e| ProviderError::invalid(QINIU, e))?;
                if let Some(text) = response_text(&value) {
                    self.latest = text.to_string();
                }

                if frame.is_final() {
                    return Ok(self.finish());
                }
                Ok(response_text(&value).map(|text| Transcript {
                    text: text.to_string(),
                    is_final: false,
                    confidence: DEFAULT_TRANSCRIPT_CONFIDENCE,
                }))
            }
            MessageType::ServerError => Err(ProviderError::invalid(
                QINIU,
                String::from_utf8_lossy(&frame.payload),
            )),
            _ => Ok(None),
        }
    }

    /// Handle one socket message. Returns the transcript to emit, if any, and
    /// whether the stream is over. Undecodable frames are dropped and the
    /// stream continues.
    fn on_message(
        &mut self,
        message: Option<Result<Message, WsError>>,
    ) -> ProviderResult<(Option<Transcript>, bool)> {
        match message {
            Some(Ok(Message::Binary(bytes))) => match WireFrame::decode(&bytes) {
                Ok(frame) => {
                    let last = frame.is_final();
                    Ok((self.on_frame(&frame)?, last))
                }
                Err(e) => {
                    warn!(error = %e, bytes = bytes.len(), "Discarding undecodable recognition frame");
                    Ok((None, false))
                }
            },
            Some(Ok(Message::Text(text))) => {
                debug!(message = %text, "Recognition server sent text message");
                Ok((None, false))
            }
            Some(Ok(Message::Close(_))) | None => Ok((self.finish(), true)),
            Some(Ok(_)) => Ok((None, false)),
            Some(Err(e)) => Err(ProviderError::request(QINIU, e)),
        }
    }

    /// Final transcript, at most once.
    fn finish(&mut self) -> Option<Transcript> {
        if self.finished || self.latest.is_empty() {
            self.finished = true;
            return None;
        }
        self.finished = true;
        Some(Transcript {
            text: std::mem::take(&mut self.latest),
            is_final: true,
            confidence: DEFAULT_TRANSCRIPT_CONFIDENCE,
        })
    }
}

#[async_trait]
impl AsrProvider for QiniuAsr {
    fn name(&self) -> &str {
        QINIU
    }

    async fn stream_recognize(
        &self,
        audio: BoxStream<'static, Vec<u8>>,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<Transcript>> {
        let endpoint = self.credentials.sign(&self.ws_url)?;
        let socket = cancel
            .run_until_cancelled(connect_ws(QINIU, endpoint, self.timeout))
            .await
            .unwrap_or(Err(ProviderError::Cancelled))?;
        let (mut sink, mut source) = socket.split();

        let uid = format!("costalk-{}", Uuid::new_v4());
        send_binary(&mut sink, session_request(&uid)).await?;
        debug!(uid = %uid, "Recognition session opened");

        let (tx, rx) = mpsc::channel(TRANSCRIPT_BUFFER);

        // Audio writer. The newest chunk is held back so the last one can be
        // flagged final once the input stream ends.
        let writer_cancel = cancel.clone();
        let writer_tx = tx.clone();
        tokio::spawn(async move {
            let mut audio = audio;
            let mut pending: Option<Vec<u8>> = None;
            let mut sequence = FIRST_AUDIO_SEQUENCE;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => return,
                    chunk = audio.next() => chunk,
                };

                let result = match next {
                    Some(chunk) => match pending.replace(chunk) {
                        Some(previous) => {
                            let sent =
                                send_binary(&mut sink, audio_request(previous, sequence, false)).await;
                            sequence += 1;
                            sent
                        }
                        None => Ok(()),
                    },
                    None => {
                        let last = pending.take().unwrap_or_default();
                        let sent = send_binary(&mut sink, audio_request(last, sequence, true)).await;
                        debug!(frames = sequence - 1, "Audio upload finished");
                        if let Err(e) = sent {
                            let _ = writer_tx.send(Err(e)).await;
                        }
                        return;
                    }
                };

                if let Err(e) = result {
                    let _ = writer_tx.send(Err(e)).await;
                    return;
                }
            }
        });

        // Server reader.
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
        let mut transcripts = self
            .stream_recognize(Box::pin(stream::iter(vec![audio])), cancel)
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
                provider: QINIU.to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        debug!(bytes, chars = text.chars().count(), "Batch recognition finished");
        Ok(text)
    }
}
