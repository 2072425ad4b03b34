//! Qiniu AI voice and chat endpoints.
//!
//! - chat: OpenAI-compatible HTTP + SSE ([`QiniuLlm`])
//! - recognition: WebSocket speaking the binary frame protocol ([`QiniuAsr`])
//! - synthesis: WebSocket with JSON responses ([`QiniuTts`])

mod asr;
mod llm;
mod tts;

pub use asr::QiniuAsr;
pub use llm::QiniuLlm;
pub use tts::QiniuTts;

/// Registry name of every Qiniu adapter.
pub const QINIU: &str = "qiniu";
