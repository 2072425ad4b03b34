//! Per-connection session configuration.
//!
//! A configuration frame replaces the whole [`SessionConfig`]; fields it
//! omits fall back to defaults. Stages never see a live reference: each one
//! gets an `Arc<SessionConfig>` snapshot taken when its work was dispatched,
//! so a configuration change mid-turn only affects later work.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::fallback::FallbackChain;
use crate::config::SessionSettings;
use crate::providers::{ProviderKind, TtsOptions};

/// Keys copied out of a FULL_CLIENT_REQUEST audio description.
const AUDIO_PARAM_KEYS: [&str; 4] = ["format", "sample_rate", "bits", "channel"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Role id from the catalog, or a literal system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SessionConfig {
    pub fn asr_chain(&self) -> FallbackChain {
        FallbackChain::for_kind(ProviderKind::Asr, non_empty(&self.asr_provider))
    }

    pub fn llm_chain(&self) -> FallbackChain {
        FallbackChain::for_kind(ProviderKind::Llm, non_empty(&self.llm_provider))
    }

    pub fn tts_chain(&self) -> FallbackChain {
        FallbackChain::for_kind(ProviderKind::Tts, non_empty(&self.tts_provider))
    }

    pub fn moderation(&self) -> Option<&str> {
        non_empty(&self.moderation_provider)
    }

    pub fn role(&self) -> Option<&str> {
        non_empty(&self.role)
    }

    /// `params.model`, when the client picked a specific LLM model.
    pub fn llm_model(&self) -> Option<String> {
        self.params
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    }

    pub fn effective_providers(&self) -> Value {
        json!({
            "asr": self.asr_chain().primary(),
            "llm": self.llm_chain().primary(),
            "tts": self.tts_chain().primary(),
            "moderation": self.moderation(),
        })
    }

    /// Voice precedence: session voice, then the role's voice, then the
    /// server default.
    pub fn tts_options(&self, settings: &SessionSettings, role_voice: Option<&str>) -> TtsOptions {
        let voice = non_empty(&self.voice)
            .or(role_voice)
            .unwrap_or(settings.default_voice.as_str())
            .to_string();
        let speed = self
            .speed
            .filter(|s| *s > 0.0)
            .unwrap_or(settings.default_speed);

        TtsOptions {
            voice,
            style: None,
            speed,
        }
    }

    /// New configuration with a wire-protocol audio description merged into
    /// `params` as `audio.<key>`.
    pub fn with_audio_params(&self, request: &Value) -> SessionConfig {
        let mut next = self.clone();
        if let Some(audio) = request.get("audio") {
            for key in AUDIO_PARAM_KEYS {
                if let Some(value) = audio.get(key).filter(|v| !v.is_null()) {
                    next.params.insert(format!("audio.{}", key), value.clone());
                }
            }
        }
        next
    }
}
