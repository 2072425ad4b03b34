//! # Connection Cancellation Scope
//!
//! Every task spawned on behalf of one WebSocket connection (dispatch loop,
//! recognition tasks, the text stage, synthesis workers, adapter I/O tasks)
//! shares a single [`CancelToken`]. Closing the connection or hitting a fatal
//! transport error flips the token once, and every holder observes it at its
//! next suspension point.
//!
//! ## Why a watch channel:
//! `tokio::sync::watch` keeps the latest value, so a task that subscribes
//! *after* cancellation still sees it immediately instead of waiting for a
//! notification it already missed.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to a connection-wide cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { state: Arc::new(tx) }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the scope has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Drive `fut` to completion unless the scope is cancelled first.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
