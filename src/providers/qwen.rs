//! Alibaba DashScope text generation (Qwen models).
//!
//! DashScope has its own request shape (`input.messages` + `parameters`)
//! rather than the OpenAI one. Streaming uses SSE with
//! `incremental_output`, so every event carries only the new text.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::credentials::CredentialSource;
use super::sse::{data_field, SseLines};
use super::{
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, LlmProvider, ProviderError, ProviderResult,
    ProviderStream, Usage,
};
use crate::cancel::CancelToken;
use crate::config::QwenConfig;

/// Registry name of the DashScope adapter.
pub const QWEN: &str = "qwen";

const STREAM_BUFFER: usize = 64;

pub struct QwenLlm {
    client: reqwest::Client,
    endpoint: String,
    default_model: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: GenerationInput<'a>,
    parameters: GenerationParameters,
}

#[derive(Serialize)]
struct GenerationInput<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Serialize)]
struct GenerationParameters {
    result_format: &'static str,
    incremental_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
struct GenerationResponse {
    #[serde(default)]
    output: Option<GenerationOutput>,
    #[serde(default)]
    usage: Option<GenerationUsage>,
    /// Set on error bodies and error events.
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GenerationOutput {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct GenerationUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<GenerationUsage> for Usage {
    fn from(usage: GenerationUsage) -> Self {
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        };
        Usage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: total,
        }
    }
}

/// DashScope reports unfinished chunks with the literal string "null".
fn finish_reason(output: &GenerationOutput) -> Option<String> {
    output
        .finish_reason
        .clone()
        .filter(|reason| !reason.is_empty() && reason != "null")
}

impl GenerationResponse {
    fn into_result(self) -> ProviderResult<(String, Option<String>, Option<Usage>)> {
        if let Some(code) = self.code.filter(|code| !code.is_empty()) {
            return Err(ProviderError::invalid(
                QWEN,
                format!("{}: {}", code, self.message.unwrap_or_default()),
            ));
        }
        let (text, reason) = match &self.output {
            Some(output) => (output.text.clone().unwrap_or_default(), finish_reason(output)),
            None => (String::new(), None),
        };
        Ok((text, reason, self.usage.map(Usage::from)))
    }
}

impl QwenLlm {
    pub fn new(
        config: &QwenConfig,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::request(QWEN, e))?;

        Ok(Self {
            client,
            endpoint: config.base_url.clone(),
            default_model: config.model.clone(),
            credentials,
            timeout,
        })
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> GenerationRequest<'a> {
        GenerationRequest {
            model: request.model.as_deref().unwrap_or(&self.default_model),
            input: GenerationInput {
                messages: &request.messages,
            },
            parameters: GenerationParameters {
                result_format: "text",
                incremental_output: stream,
                temperature: request.temperature,
                top_p: request.top_p,
                max_tokens: request.max_tokens,
            },
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> ProviderResult<reqwest::Response> {
        let signed = self.credentials.sign(&self.endpoint)?;

        let mut builder = self
            .client
            .post(&signed.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&self.body(request, stream));
        for (name, value) in &signed.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if stream {
            builder = builder
                .header(ACCEPT, "text/event-stream")
                .header("X-DashScope-SSE", "enable");
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| ProviderError::request(QWEN, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: QWEN.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Timeout {
            provider: QWEN.to_string(),
            seconds: self.timeout.as_secs(),
        }
    }
}

#[async_trait]
impl LlmProvider for QwenLlm {
    fn name(&self) -> &str {
        QWEN
    }

    async fn chat(&self, request: ChatRequest, cancel: CancelToken) -> ProviderResult<ChatResponse> {
        let call = async {
            let response = self.send(&request, false).await?;
            let parsed: GenerationResponse = tokio::time::timeout(self.timeout, response.json())
                .await
                .map_err(|_| self.timed_out())?
                .map_err(|e| ProviderError::invalid(QWEN, e))?;

            let (text, finish_reason, usage) = parsed.into_result()?;
            Ok::<_, ProviderError>(ChatResponse { text, finish_reason, usage })
        };

        cancel
            .run_until_cancelled(call)
            .await
            .unwrap_or(Err(ProviderError::Cancelled))
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancelToken,
    ) -> ProviderResult<ProviderStream<ChatDelta>> {
        let response = cancel
            .run_until_cancelled(self.send(&request, true))
            .await
            .unwrap_or(Err(ProviderError::Cancelled))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut body = Box::pin(response.bytes_stream());

        tokio::spawn(async move {
            let mut lines = SseLines::default();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.try_send(Err(ProviderError::Cancelled));
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                let (batch, finished) = match chunk {
                    Some(Ok(bytes)) => (lines.push(&bytes), false),
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ProviderError::request(QWEN, e))).await;
                        return;
                    }
                    None => (lines.finish().into_iter().collect(), true),
                };

                for line in batch {
                    match parse_event(&line) {
                        Ok(StreamEvent::Delta(delta)) => {
                            let terminal = delta.is_terminal();
                            if tx.send(Ok(delta)).await.is_err() || terminal {
                                debug!(terminal, "Generation stream finished");
                                return;
                            }
                        }
                        Ok(StreamEvent::Failed(e)) => {
                            warn!(error = %e, "Generation stream reported an error");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        Ok(StreamEvent::Ignore) => {}
                        Err(e) => warn!(error = %e, "Skipping malformed stream chunk"),
                    }
                }

                if finished {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug)]
enum StreamEvent {
    Delta(ChatDelta),
    /// The vendor reported an error inside the stream.
    Failed(ProviderError),
    Ignore,
}

fn parse_event(line: &str) -> Result<StreamEvent, serde_json::Error> {
    let Some(data) = data_field(line) else {
        return Ok(StreamEvent::Ignore);
    };
    if data == "[DONE]" {
        return Ok(StreamEvent::Delta(ChatDelta {
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }));
    }

    let parsed: GenerationResponse = serde_json::from_str(data)?;
    let (text, finish_reason, usage) = match parsed.into_result() {
        Ok(parts) => parts,
        Err(e) => return Ok(StreamEvent::Failed(e)),
    };

    if text.is_empty() && finish_reason.is_none() {
        return Ok(StreamEvent::Ignore);
    }
    Ok(StreamEvent::Delta(ChatDelta { text, finish_reason, usage }))
}
