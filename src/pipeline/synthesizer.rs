//! # Sequential Synthesis
//!
//! Sentences from the LLM stage are spoken strictly one at a time per
//! connection. Every emitted audio chunk gets the next value of a
//! connection-wide sequence counter, so clients can play chunks back in
//! order even across turns.
//!
//! ## How ordering is kept:
//! - one worker task per turn drains a bounded sentence queue in FIFO order
//! - a per-connection async mutex (the synthesis gate) is held for the whole
//!   of one sentence, from the first vendor call until its last chunk is
//!   written
//! - chunks are written as they arrive, so playback can start before the
//!   sentence is fully synthesized
//!
//! ## Failure policy:
//! A sentence whose every TTS candidate failed before producing audio is
//! logged and dropped; the turn keeps going with the next sentence.

use futures_util::stream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::protocol::OutboundFrame;
use crate::providers::{ProviderError, ProviderRegistry, ProviderResult, TtsOptions, TtsProvider};
use crate::session::fallback::FallbackChain;
use crate::session::OutboundWriter;

/// Provider chain and voice options for one turn.
#[derive(Debug, Clone)]
pub struct SynthesisPlan {
    pub chain: FallbackChain,
    pub options: TtsOptions,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisSummary {
    pub sentences: usize,
    pub chunks: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub struct SequentialSynthesizer {
    gate: Mutex<()>,
    sequence: AtomicU64,
    registry: Arc<ProviderRegistry>,
    writer: OutboundWriter,
}

impl SequentialSynthesizer {
    pub fn new(registry: Arc<ProviderRegistry>, writer: OutboundWriter) -> Self {
        Self {
            gate: Mutex::new(()),
            sequence: AtomicU64::new(0),
            registry,
            writer,
        }
    }

    /// Next connection-wide audio sequence number, starting at 1.
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start a worker for one turn. Sentences submitted to the returned queue
    /// are synthesized in submission order.
    pub fn start(self: &Arc<Self>, plan: SynthesisPlan, capacity: usize, cancel: CancelToken) -> SentenceQueue {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(self.clone().drain(rx, plan, cancel));
        SentenceQueue {
            tx,
            worker,
            dropped: 0,
        }
    }

    async fn drain(
        self: Arc<Self>,
        mut sentences: mpsc::Receiver<String>,
        plan: SynthesisPlan,
        cancel: CancelToken,
    ) -> SynthesisSummary {
        let mut summary = SynthesisSummary::default();

        while let Some(Some(sentence)) = cancel.run_until_cancelled(sentences.recv()).await {
            match self.synthesize(&sentence, &plan, &cancel).await {
                Ok(chunks) => {
                    summary.sentences += 1;
                    summary.chunks += chunks;
                }
                Err(ProviderError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, sentence = %sentence, "Dropping sentence after synthesis failure");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Speak one sentence through the fallback chain. Moving to the next
    /// candidate only happens while no audio has been written for it.
    pub async fn synthesize(
        &self,
        sentence: &str,
        plan: &SynthesisPlan,
        cancel: &CancelToken,
    ) -> ProviderResult<usize> {
        let _gate = self.gate.lock().await;

        let (provider, chunks) = plan
            .chain
            .run(
                |name| self.registry.get_tts(name),
                |provider| self.stream_sentence(provider, sentence, &plan.options, cancel),
            )
            .await?;

        debug!(provider = %provider, chunks, "Sentence synthesized");
        Ok(chunks)
    }

    async fn stream_sentence(
        &self,
        provider: Arc<dyn TtsProvider>,
        sentence: &str,
        options: &TtsOptions,
        cancel: &CancelToken,
    ) -> ProviderResult<usize> {
        let text = Box::pin(stream::iter(vec![sentence.to_string()]));
        let mut chunks = provider
            .synthesize_stream(text, options.clone(), cancel.clone())
            .await?;

        let mut emitted = 0usize;
        while let Some(item) = cancel
            .run_until_cancelled(chunks.next())
            .await
            .ok_or(ProviderError::Cancelled)?
        {
            match item {
                Ok(chunk) if chunk.data.is_empty() => continue,
                Ok(chunk) => {
                    let frame = OutboundFrame::audio(self.next_sequence(), &chunk, sentence);
                    self.writer
                        .send(frame)
                        .await
                        .map_err(|_| ProviderError::Cancelled)?;
                    emitted += 1;
                }
                Err(e) if emitted == 0 => return Err(e),
                Err(e) => {
                    return Err(ProviderError::Interrupted {
                        provider: provider.name().to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(emitted)
    }
}

/// Producer side of one turn's sentence queue.
pub struct SentenceQueue {
    tx: mpsc::Sender<String>,
    worker: JoinHandle<SynthesisSummary>,
    dropped: usize,
}

impl SentenceQueue {
    /// Enqueue without waiting. A full queue drops the new sentence.
    pub fn submit(&mut self, sentence: String) -> bool {
        match self.tx.try_send(sentence) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(sentence)) => {
                warn!(sentence = %sentence, "Sentence queue full, dropping sentence");
                self.dropped += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the queue and wait until every accepted sentence is spoken.
    pub async fn finish(self) -> SynthesisSummary {
        drop(self.tx);
        let mut summary = self.worker.await.unwrap_or_default();
        summary.dropped += self.dropped;
        summary
    }
}
