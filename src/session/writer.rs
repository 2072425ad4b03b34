//! Serialized outbound writes.
//!
//! Several tasks produce frames for one connection (dispatch loop, recognition
//! tasks, the LLM stage, the synthesis worker). They all write through a
//! single [`OutboundWriter`], which holds an async mutex around the transport
//! so frames never interleave. A failed write is fatal for the connection:
//! the writer cancels the session scope.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::protocol::OutboundFrame;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("failed to serialize outbound frame: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport write failed: {0}")]
    Write(String),
}

/// Where serialized frames go. The WebSocket actor implements this in
/// production; tests capture frames in memory.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) {}
}

#[derive(Clone)]
pub struct OutboundWriter {
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
    cancel: CancelToken,
    session_id: Arc<str>,
}

impl OutboundWriter {
    pub fn new(sink: Box<dyn FrameSink>, cancel: CancelToken, session_id: &str) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            cancel,
            session_id: Arc::from(session_id),
        }
    }

    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = frame.to_json()?;

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send_text(text).await {
            error!(session_id = %self.session_id, error = %e, "Outbound write failed, closing session");
            self.cancel.cancel();
            return Err(e);
        }
        Ok(())
    }

    pub async fn send_error(&self, code: u16, message: &str) -> Result<(), TransportError> {
        debug!(session_id = %self.session_id, code, detail = message, "Sending error frame");
        self.send(OutboundFrame::error(code, message)).await
    }

    pub async fn close(&self) {
        self.sink.lock().await.close().await;
    }
}
