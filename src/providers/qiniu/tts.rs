use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::QINIU;
use crate::cancel::CancelToken;
use crate::config::QiniuConfig;
use crate::providers::credentials::CredentialSource;
use crate::providers::socket::connect_ws;
use crate::providers::{AudioChunk, ProviderError, ProviderResult, ProviderStream, TtsOptions, TtsProvider};

const AUDIO_ENCODING: &str = "mp3";
const CHUNK_BUFFER: usize = 32;

/// Per-sentence synthesis over a WebSocket, one connection per text item.
pub struct QiniuTts {
    ws_url: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    audio: SynthesisAudio<'a>,
    request: SynthesisText<'a>,
}

#[derive(Serialize)]
struct SynthesisAudio<'a> {
    voice_type: &'a str,
    encoding: &'a str,
    speed_ratio: f32,
}

#[derive(Serialize)]
struct SynthesisText<'a> {
    text: &'a str,
}

#[derive(Deserialize, Debug)]
struct SynthesisResponse {
    #[serde(default)]
    sequence: i64,
    #[serde(default)]
    data: String,
}

impl SynthesisResponse {
    fn is_last(&self) -> bool {
        self.sequence < 0
    }
}

fn request_body(text: &str, options: &TtsOptions) -> ProviderResult<Vec<u8>> {
    let request = SynthesisRequest {
        audio: SynthesisAudio {
            voice_type: &options.voice,
            encoding: AUDIO_ENCODING,
            speed_ratio: if options.speed > 0.0 { options.speed } else { 1.0 },
        },
        request: SynthesisText { text },
    };
    serde_json::to_vec(&request).map_err(|e| ProviderError::invalid(QINIU, e))
}

impl QiniuTts {
    pub fn new(config: &QiniuConfig, credentials: Arc<dyn CredentialSource>, timeout: Duration) -> Self {
        Self {
            ws_url: config.tts_ws_url.clone(),
            credentials,
            timeout,
        }
    }

    /// Synthesize one text item, forwarding chunks as they arrive.
    async fn synthesize_one(
        ws_url: &str,
        credentials: &dyn CredentialSource,
        timeout: Duration,
        text: &str,
        options: &TtsOptions,
        tx: &mpsc::Sender<ProviderResult<AudioChunk>>,
    ) -> ProviderResult<usize> {
        let endpoint = credentials.sign(ws_url)?.with_header("VoiceType", options.voice.clone());
        let mut socket = connect_ws(QINIU, endpoint, timeout).await?;

        socket
            .send(Message::Binary(request_body(text, options)?))
            .await
            .map_err(|e| ProviderError::request(QINIU, e))?;

        let mut chunks = 0usize;
        let mut bytes = 0usize;
        loop {
            let message = tokio::time::timeout(timeout, socket.next())
                .await
                .map_err(|_| ProviderError::Timeout {
                    provider: QINIU.to_string(),
                    seconds: timeout.as_secs(),
                })?;

            let raw = match message {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(data))) => data.into_bytes(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ProviderError::request(QINIU, e)),
            };

            let response: SynthesisResponse = match serde_json::from_slice(&raw) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable synthesis response");
                    continue;
                }
            };

            let audio = BASE64
                .decode(response.data.as_bytes())
                .map_err(|e| ProviderError::invalid(QINIU, e))?;
            if !audio.is_empty() {
                bytes += audio.len();
                let chunk = AudioChunk {
                    data: audio,
                    format: AUDIO_ENCODING.to_string(),
                    sequence_number: chunks as u32,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
                chunks += 1;
            }

            if response.is_last() {
                break;
            }
        }

        let _ = socket.close(None).await;
        debug!(chunks, bytes, "Synthesis finished");
        Ok(chunks)
    }
}

#[async_trait]
impl TtsProvider for QiniuTts {
    fn name(&self) -> &str {
        QINIU
    }

    async fn synthesize_stream(
        &self,
        text: BoxStream<'static, String>,
        options: TtsOptions,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<AudioChunk>> {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let ws_url = self.ws_url.clone();
        let credentials = self.credentials.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut text = text;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = text.next() => item,
                };
                let Some(item) = item else { return };
                if item.trim().is_empty() {
                    continue;
                }

                let synthesis = QiniuTts::synthesize_one(
                    &ws_url,
                    credentials.as_ref(),
                    timeout,
                    &item,
                    &options,
                    &tx,
                );
                match cancel.run_until_cancelled(synthesis).await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {
                        let _ = tx.try_send(Err(ProviderError::Cancelled));
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
