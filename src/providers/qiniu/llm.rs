use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::QINIU;
use crate::providers::sse::{data_field, SseLines};
use crate::cancel::CancelToken;
use crate::config::QiniuConfig;
use crate::providers::credentials::CredentialSource;
use crate::providers::{
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, LlmProvider, ProviderError, ProviderResult,
    ProviderStream, Usage,
};

const STREAM_BUFFER: usize = 64;

/// Chat completions over the OpenAI-compatible HTTP API.
pub struct QiniuLlm {
    client: reqwest::Client,
    endpoint: String,
    default_model: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

impl QiniuLlm {
    pub fn new(
        config: &QiniuConfig,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::request(QINIU, e))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            default_model: config.llm_model.clone(),
            credentials,
            timeout,
        })
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: request.model.as_deref().unwrap_or(&self.default_model),
            messages: &request.messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream,
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
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| ProviderError::request(QINIU, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: QINIU.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Timeout {
            provider: QINIU.to_string(),
            seconds: self.timeout.as_secs(),
        }
    }
}

#[async_trait]
impl LlmProvider for QiniuLlm {
    fn name(&self) -> &str {
        QINIU
    }

    async fn chat(&self, request: ChatRequest, cancel: CancelToken) -> ProviderResult<ChatResponse> {
        let call = async {
            let response = self.send(&request, false).await?;
            let parsed: CompletionResponse = tokio::time::timeout(self.timeout, response.json())
                .await
                .map_err(|_| self.timed_out())?
                .map_err(|e| ProviderError::invalid(QINIU, e))?;

            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::invalid(QINIU, "no choices in response"))?;

            Ok::<_, ProviderError>(ChatResponse {
                text: choice.message.and_then(|m| m.content).unwrap_or_default(),
                finish_reason: choice.finish_reason,
                usage: parsed.usage,
            })
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
                        let _ = tx.send(Err(ProviderError::request(QINIU, e))).await;
                        return;
                    }
                    None => (lines.finish().into_iter().collect(), true),
                };

                for line in batch {
                    match parse_sse_line(&line) {
                        Ok(SseEvent::Delta(delta)) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        Ok(SseEvent::Done) => {
                            debug!("Chat stream finished");
                            return;
                        }
                        Ok(SseEvent::Ignore) => {}
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

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(ChatDelta),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, serde_json::Error> {
    let Some(data) = data_field(line) else {
        return Ok(SseEvent::Ignore);
    };
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: CompletionResponse = serde_json::from_str(data)?;
    let (text, finish_reason) = match chunk.choices.into_iter().next() {
        Some(choice) => (
            choice.delta.and_then(|d| d.content).unwrap_or_default(),
            choice.finish_reason.filter(|reason| !reason.is_empty()),
        ),
        None => (String::new(), None),
    };

    if text.is_empty() && finish_reason.is_none() && chunk.usage.is_none() {
        return Ok(SseEvent::Ignore);
    }

    Ok(SseEvent::Delta(ChatDelta {
        text,
        finish_reason,
        usage: chunk.usage,
    }))
}
