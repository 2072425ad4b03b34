//! # Configuration Management
//!
//! Application configuration comes from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - A few well-known variables used by hosting platforms and vendors
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are read from TOML/env and written back as JSON
//! - **`#[serde(default)]`**: a config file only has to mention what it changes
//! - **Option<T>**: settings that may legitimately be absent (API keys, file paths)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, vendor keys (`QINIU_API_KEY`, `QWEN_API_KEY`, `IFLYTEK_*`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_SESSION__DEFAULT_VOICE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where to listen
/// - `providers`: vendor endpoints and credentials
/// - `session`: per-connection defaults and queue sizes
/// - `performance`: global limits
/// - `roles`: optional role catalog file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub roles: RolesConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Vendor endpoints. Providers without credentials are simply not registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub qiniu: QiniuConfig,
    #[serde(default)]
    pub qwen: QwenConfig,
    #[serde(default)]
    pub iflytek: IflytekConfig,
    /// Connect / first-response timeout for vendor calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            qiniu: QiniuConfig::default(),
            qwen: QwenConfig::default(),
            iflytek: IflytekConfig::default(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QiniuConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub asr_ws_url: String,
    pub tts_ws_url: String,
    pub llm_model: String,
}

impl Default for QiniuConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openai.qiniu.com/v1".to_string(),
            asr_ws_url: "wss://openai.qiniu.com/v1/voice/asr".to_string(),
            tts_ws_url: "wss://api.qnaigc.com/v1/voice/tts".to_string(),
            llm_model: "deepseek-v3".to_string(),
        }
    }
}

/// Alibaba DashScope text generation (Qwen models).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation"
                .to_string(),
            model: "qwen-turbo".to_string(),
        }
    }
}

/// iFlytek speech dictation and synthesis. All three credentials are
/// required; endpoints are signed per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IflytekConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub asr_ws_url: String,
    pub tts_ws_url: String,
    /// Speaker used when the session voice belongs to another vendor.
    pub default_voice: String,
}

impl IflytekConfig {
    /// `(app_id, api_key, api_secret)` when all are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.is_empty())
        }
        Some((
            present(&self.app_id)?,
            present(&self.api_key)?,
            present(&self.api_secret)?,
        ))
    }
}

impl Default for IflytekConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_key: None,
            api_secret: None,
            asr_ws_url: "wss://iat-api.xfyun.cn/v2/iat".to_string(),
            tts_ws_url: "wss://tts-api.xfyun.cn/v2/tts".to_string(),
            default_voice: "xiaoyan".to_string(),
        }
    }
}

/// Defaults and limits applied to every chat session.
///
/// ## Queue sizing:
/// Each pipeline stage hands work to the next through a bounded queue.
/// When a queue is full the newest item is dropped and a warning logged,
/// which keeps a slow vendor from stalling the whole connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub default_voice: String,
    pub default_speed: f32,
    /// Inbound WebSocket messages waiting for the dispatch loop.
    pub inbound_queue_capacity: usize,
    /// Final transcripts and text frames waiting for the LLM stage.
    pub text_queue_capacity: usize,
    /// Complete sentences waiting for synthesis.
    pub sentence_queue_capacity: usize,
    /// Live audio frames waiting for the recognizer.
    pub audio_queue_capacity: usize,
    pub asr_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_voice: "qiniu_zh_female_wwxkjx".to_string(),
            default_speed: 1.0,
            inbound_queue_capacity: 64,
            text_queue_capacity: 8,
            sentence_queue_capacity: 32,
            audio_queue_capacity: 128,
            asr_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolesConfig {
    /// TOML file replacing the built-in role catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<String>,
}

/// Vendor credentials read from their conventional variable names.
const VENDOR_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("QINIU_API_KEY", "providers.qiniu.api_key"),
    ("QWEN_API_KEY", "providers.qwen.api_key"),
    ("IFLYTEK_APP_ID", "providers.iflytek.app_id"),
    ("IFLYTEK_API_KEY", "providers.iflytek.api_key"),
    ("IFLYTEK_API_SECRET", "providers.iflytek.api_secret"),
];

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_SESSION__SENTENCE_QUEUE_CAPACITY=64`: Override a session setting
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `QINIU_API_KEY=...`, `IFLYTEK_APP_ID=...`: Vendor credentials without the APP_ prefix
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        for (var, key) in VENDOR_ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let session = &self.session;
        if !(session.default_speed > 0.0) {
            return Err(anyhow::anyhow!("Default speech speed must be positive"));
        }

        for (name, capacity) in [
            ("inbound_queue_capacity", session.inbound_queue_capacity),
            ("text_queue_capacity", session.text_queue_capacity),
            ("sentence_queue_capacity", session.sentence_queue_capacity),
            ("audio_queue_capacity", session.audio_queue_capacity),
        ] {
            if capacity == 0 {
                return Err(anyhow::anyhow!("{} must be greater than 0", name));
            }
        }

        if session.asr_timeout_secs == 0 || self.providers.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial runtime update, e.g. `{"session": {"default_voice": "v2"}}`.
    ///
    /// Only the `session` and `performance` sections can change at runtime;
    /// listeners and vendor credentials are fixed at startup. New values
    /// apply to sessions opened afterwards.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(session) = partial.get("session") {
            let s = &mut updated.session;
            if let Some(voice) = session.get("default_voice").and_then(|v| v.as_str()) {
                s.default_voice = voice.to_string();
            }
            if let Some(speed) = session.get("default_speed").and_then(|v| v.as_f64()) {
                s.default_speed = speed as f32;
            }
            let capacities = [
                ("inbound_queue_capacity", &mut s.inbound_queue_capacity),
                ("text_queue_capacity", &mut s.text_queue_capacity),
                ("sentence_queue_capacity", &mut s.sentence_queue_capacity),
                ("audio_queue_capacity", &mut s.audio_queue_capacity),
            ];
            for (name, slot) in capacities {
                if let Some(value) = session.get(name).and_then(|v| v.as_u64()) {
                    *slot = value as usize;
                }
            }
            if let Some(timeout) = session.get("asr_timeout_secs").and_then(|v| v.as_u64()) {
                s.asr_timeout_secs = timeout;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                updated.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        // Only commit when the result is still valid.
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.default_voice, "qiniu_zh_female_wwxkjx");
        assert_eq!(config.providers.qiniu.llm_model, "deepseek-v3");
        assert!(config.providers.qiniu.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.sentence_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.default_speed = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"default_voice": "v2", "text_queue_capacity": 4}, "performance": {"max_concurrent_sessions": 5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.default_voice, "v2");
        assert_eq!(config.session.text_queue_capacity, 4);
        assert_eq!(config.performance.max_concurrent_sessions, 5);
        // Other fields should remain unchanged
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.sentence_queue_capacity, 32);
    }

    #[test]
    fn test_invalid_update_is_not_applied() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"default_voice": "v9", "audio_queue_capacity": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.session.default_voice, "qiniu_zh_female_wwxkjx");
        assert_eq!(config.session.audio_queue_capacity, 128);
    }

    #[test]
    fn test_iflytek_needs_every_credential() {
        let mut iflytek = IflytekConfig {
            app_id: Some("app".into()),
            api_key: Some("key".into()),
            ..IflytekConfig::default()
        };
        assert!(iflytek.credentials().is_none());

        iflytek.api_secret = Some(String::new());
        assert!(iflytek.credentials().is_none());

        iflytek.api_secret = Some("secret".into());
        assert_eq!(iflytek.credentials(), Some(("app", "key", "secret")));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.session.text_queue_capacity, 8);
        assert_eq!(config.performance.max_concurrent_sessions, 100);
        assert_eq!(config.providers.qwen.model, "qwen-turbo");
        assert_eq!(config.providers.iflytek.default_voice, "xiaoyan");
    }

    #[test]
    fn test_vendor_sections_from_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [providers]
            request_timeout_secs = 10

            [providers.qwen]
            api_key = "sk-qwen"
            base_url = "https://dashscope.example/generation"
            model = "qwen-plus"

            [providers.iflytek]
            app_id = "app"
            api_key = "key"
            api_secret = "secret"
            asr_ws_url = "wss://iat.example/v2/iat"
            tts_ws_url = "wss://tts.example/v2/tts"
            default_voice = "aisjiuxu"
            "#,
        )
        .unwrap();
        assert_eq!(config.providers.qwen.api_key.as_deref(), Some("sk-qwen"));
        assert_eq!(config.providers.qwen.model, "qwen-plus");
        assert!(config.providers.iflytek.credentials().is_some());
        assert_eq!(config.providers.qiniu.llm_model, "deepseek-v3");
    }
}
