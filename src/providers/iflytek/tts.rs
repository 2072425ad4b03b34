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

use super::{Envelope, IFLYTEK, STATUS_LAST};
use crate::cancel::CancelToken;
use crate::config::IflytekConfig;
use crate::providers::credentials::CredentialSource;
use crate::providers::socket::connect_ws;
use crate::providers::{AudioChunk, ProviderError, ProviderResult, ProviderStream, TtsOptions, TtsProvider};

const AUDIO_FORMAT: &str = "pcm";
const CHUNK_BUFFER: usize = 32;
const NEUTRAL_LEVEL: u8 = 50;

/// Online synthesis, one connection per text item.
#[derive(Clone)]
pub struct IflytekTts {
    ws_url: String,
    app_id: String,
    default_voice: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    common: Common<'a>,
    business: Business<'a>,
    data: TextData,
}

#[derive(Serialize)]
struct Common<'a> {
    app_id: &'a str,
}

#[derive(Serialize)]
struct Business<'a> {
    aue: &'static str,
    auf: &'static str,
    vcn: &'a str,
    speed: u8,
    volume: u8,
    pitch: u8,
    tte: &'static str,
}

#[derive(Serialize)]
struct TextData {
    status: u8,
    text: String,
}

#[derive(Deserialize, Debug, Default)]
struct SynthesisData {
    #[serde(default)]
    audio: String,
    #[serde(default)]
    status: u8,
}

/// Voices from other vendors fall back to the configured default.
fn voice<'a>(options: &'a TtsOptions, default_voice: &'a str) -> &'a str {
    if options.voice.is_empty() || options.voice.starts_with("qiniu_") {
        default_voice
    } else {
        &options.voice
    }
}

/// Speed ratio (1.0 = normal) on the vendor's 0..=100 scale.
fn speed_level(speed: f32) -> u8 {
    if speed <= 0.0 {
        return NEUTRAL_LEVEL;
    }
    (speed * f32::from(NEUTRAL_LEVEL)).round().clamp(0.0, 100.0) as u8
}

fn request_body(app_id: &str, vcn: &str, text: &str, options: &TtsOptions) -> ProviderResult<Message> {
    let request = SynthesisRequest {
        common: Common { app_id },
        business: Business {
            aue: "raw",
            auf: "audio/L16;rate=16000",
            vcn,
            speed: speed_level(options.speed),
            volume: NEUTRAL_LEVEL,
            pitch: NEUTRAL_LEVEL,
            tte: "UTF8",
        },
        data: TextData {
            status: STATUS_LAST,
            text: BASE64.encode(text),
        },
    };
    let body = serde_json::to_string(&request).map_err(|e| ProviderError::invalid(IFLYTEK, e))?;
    Ok(Message::Text(body))
}

impl IflytekTts {
    pub fn new(
        config: &IflytekConfig,
        app_id: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            ws_url: config.tts_ws_url.clone(),
            app_id: app_id.into(),
            default_voice: config.default_voice.clone(),
            credentials,
            timeout,
        }
    }

    /// Synthesize one text item, forwarding chunks as they arrive.
    async fn synthesize_one(
        &self,
        text: &str,
        options: &TtsOptions,
        tx: &mpsc::Sender<ProviderResult<AudioChunk>>,
    ) -> ProviderResult<usize> {
        let endpoint = self.credentials.sign(&self.ws_url)?;
        let mut socket = connect_ws(IFLYTEK, endpoint, self.timeout).await?;

        let vcn = voice(options, &self.default_voice);
        socket
            .send(request_body(&self.app_id, vcn, text, options)?)
            .await
            .map_err(|e| ProviderError::request(IFLYTEK, e))?;

        let mut chunks = 0usize;
        let mut bytes = 0usize;
        loop {
            let message = tokio::time::timeout(self.timeout, socket.next())
                .await
                .map_err(|_| ProviderError::Timeout {
                    provider: IFLYTEK.to_string(),
                    seconds: self.timeout.as_secs(),
                })?;

            let raw = match message {
                Some(Ok(Message::Text(data))) => data.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ProviderError::request(IFLYTEK, e)),
            };

            let envelope: Envelope<SynthesisData> = match serde_json::from_slice(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable synthesis response");
                    continue;
                }
            };
            let data = envelope.into_data()?.unwrap_or_default();

            let audio = BASE64
                .decode(data.audio.as_bytes())
                .map_err(|e| ProviderError::invalid(IFLYTEK, e))?;
            if !audio.is_empty() {
                bytes += audio.len();
                let chunk = AudioChunk {
                    data: audio,
                    format: AUDIO_FORMAT.to_string(),
                    sequence_number: chunks as u32,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
                chunks += 1;
            }

            if data.status == STATUS_LAST {
                break;
            }
        }

        let _ = socket.close(None).await;
        debug!(chunks, bytes, voice = vcn, "Synthesis finished");
        Ok(chunks)
    }
}

#[async_trait]
impl TtsProvider for IflytekTts {
    fn name(&self) -> &str {
        IFLYTEK
    }

    async fn synthesize_stream(
        &self,
        text: BoxStream<'static, String>,
        options: TtsOptions,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<AudioChunk>> {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let tts = self.clone();

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

                match cancel.run_until_cancelled(tts.synthesize_one(&item, &options, &tx)).await {
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
