//! Session lifecycle: Idle → Configured → Processing ⇄ Configured → Closed.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configured,
    Processing,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    active_turns: usize,
}

/// Shared state cell. Work in flight is counted so the session returns to
/// `Configured` only when the last piece of work finishes.
#[derive(Debug, Clone)]
pub struct SessionStateCell {
    inner: Arc<Mutex<Inner>>,
}

impl SessionStateCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                active_turns: 0,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    pub fn get(&self) -> SessionState {
        self.with(|inner| inner.state)
    }

    /// A configuration frame was accepted.
    pub fn configure(&self) {
        self.with(|inner| {
            if inner.state == SessionState::Idle {
                inner.state = SessionState::Configured;
            }
        });
    }

    /// Mark work as started. Returns `None` once the session is closed.
    pub fn begin_work(&self) -> Option<WorkGuard> {
        self.with(|inner| {
            if inner.state == SessionState::Closed {
                return None;
            }
            inner.active_turns += 1;
            inner.state = SessionState::Processing;
            Some(WorkGuard { cell: self.clone() })
        })
    }

    fn end_work(&self) {
        self.with(|inner| {
            inner.active_turns = inner.active_turns.saturating_sub(1);
            if inner.active_turns == 0 && inner.state == SessionState::Processing {
                inner.state = SessionState::Configured;
            }
        });
    }

    pub fn close(&self) {
        self.with(|inner| inner.state = SessionState::Closed);
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends one unit of work on drop.
#[derive(Debug)]
pub struct WorkGuard {
    cell: SessionStateCell,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.cell.end_work();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let state = SessionStateCell::new();
        assert_eq!(state.get(), SessionState::Idle);

        state.configure();
        assert_eq!(state.get(), SessionState::Configured);

        let first = state.begin_work().unwrap();
        let second = state.begin_work().unwrap();
        assert_eq!(state.get(), SessionState::Processing);

        drop(first);
        assert_eq!(state.get(), SessionState::Processing);
        drop(second);
        assert_eq!(state.get(), SessionState::Configured);

        state.close();
        assert!(state.begin_work().is_none());
        assert_eq!(state.get(), SessionState::Closed);
    }

    #[test]
    fn test_work_from_idle_uses_defaults() {
        let state = SessionStateCell::new();
        let guard = state.begin_work().unwrap();
        assert_eq!(state.get(), SessionState::Processing);
        drop(guard);
        assert_eq!(state.get(), SessionState::Configured);
    }

    #[test]
    fn test_close_during_work_stays_closed() {
        let state = SessionStateCell::new();
        let guard = state.begin_work().unwrap();
        state.close();
        drop(guard);
        assert_eq!(state.get(), SessionState::Closed);
    }
}
