//! # Voice Chat Sessions
//!
//! Everything that lives for the duration of one `/ws/chat` connection:
//! per-session configuration, lifecycle state, the serialized outbound
//! writer, provider fallback chains, and the orchestrator that ties the
//! pipeline stages together.

pub mod config;
pub mod fallback;
pub mod orchestrator;
pub mod state;
pub mod writer;

pub use config::SessionConfig;
pub use orchestrator::{InboundMessage, Session, SessionDeps};
pub use state::{SessionState, SessionStateCell};
pub use writer::{FrameSink, OutboundWriter, TransportError};
