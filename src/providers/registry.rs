//! # Provider Registry
//!
//! Name → implementation lookup for each capability kind. The registry is
//! filled once at startup and then shared read-only behind an `Arc` by every
//! session, so lookups take no locks.
//!
//! ## Discovery:
//! `/api/v1/services*` endpoints report what is registered through
//! [`ProviderInfo`] records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::credentials::{BearerToken, CredentialSource};
use super::iflytek::{IflytekAsr, IflytekSigner, IflytekTts, IFLYTEK};
use super::qiniu::{QiniuAsr, QiniuLlm, QiniuTts, QINIU};
use super::qwen::{QwenLlm, QWEN};
use super::{
    AsrProvider, LlmProvider, ModerationProvider, ProviderError, ProviderKind, ProviderResult,
    TtsProvider,
};
use crate::config::ProvidersConfig;

/// Discovery record for one registered provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub status: String,
    pub capabilities: Vec<String>,
}

impl ProviderInfo {
    fn online(name: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            status: "online".to_string(),
            capabilities: kind.capabilities().iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    asr: HashMap<String, Arc<dyn AsrProvider>>,
    llm: HashMap<String, Arc<dyn LlmProvider>>,
    tts: HashMap<String, Arc<dyn TtsProvider>>,
    moderation: HashMap<String, Arc<dyn ModerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every vendor adapter that has credentials configured.
    pub fn from_config(config: &ProvidersConfig) -> ProviderResult<Self> {
        let mut registry = Self::new();
        let timeout = Duration::from_secs(config.request_timeout_secs);

        match config.qiniu.api_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => {
                let credentials: Arc<dyn CredentialSource> = Arc::new(BearerToken::new(key));
                let qiniu = &config.qiniu;

                registry.register_llm(Arc::new(QiniuLlm::new(qiniu, credentials.clone(), timeout)?));
                registry.register_asr(Arc::new(QiniuAsr::new(qiniu, credentials.clone(), timeout)));
                registry.register_tts(Arc::new(QiniuTts::new(qiniu, credentials, timeout)));
                info!("Registered {} providers for asr, llm and tts", QINIU);
            }
            None => {
                info!("No {} API key configured, skipping its providers", QINIU);
            }
        }

        match config.qwen.api_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => {
                let credentials: Arc<dyn CredentialSource> = Arc::new(BearerToken::new(key));
                registry.register_llm(Arc::new(QwenLlm::new(&config.qwen, credentials, timeout)?));
                info!("Registered {} provider for llm", QWEN);
            }
            None => {
                info!("No {} API key configured, skipping its providers", QWEN);
            }
        }

        match config.iflytek.credentials() {
            Some((app_id, api_key, api_secret)) => {
                let signer: Arc<dyn CredentialSource> = Arc::new(IflytekSigner::new(api_key, api_secret));
                let iflytek = &config.iflytek;

                registry.register_asr(Arc::new(IflytekAsr::new(iflytek, app_id, signer.clone(), timeout)));
                registry.register_tts(Arc::new(IflytekTts::new(iflytek, app_id, signer, timeout)));
                info!("Registered {} providers for asr and tts", IFLYTEK);
            }
            None => {
                info!("No {} credentials configured, skipping its providers", IFLYTEK);
            }
        }

        Ok(registry)
    }

    pub fn register_asr(&mut self, provider: Arc<dyn AsrProvider>) {
        self.asr.insert(provider.name().to_string(), provider);
    }

    pub fn register_llm(&mut self, provider: Arc<dyn LlmProvider>) {
        self.llm.insert(provider.name().to_string(), provider);
    }

    pub fn register_tts(&mut self, provider: Arc<dyn TtsProvider>) {
        self.tts.insert(provider.name().to_string(), provider);
    }

    pub fn register_moderation(&mut self, provider: Arc<dyn ModerationProvider>) {
        self.moderation.insert(provider.name().to_string(), provider);
    }

    pub fn get_asr(&self, name: &str) -> ProviderResult<Arc<dyn AsrProvider>> {
        lookup(&self.asr, ProviderKind::Asr, name)
    }

    pub fn get_llm(&self, name: &str) -> ProviderResult<Arc<dyn LlmProvider>> {
        lookup(&self.llm, ProviderKind::Llm, name)
    }

    pub fn get_tts(&self, name: &str) -> ProviderResult<Arc<dyn TtsProvider>> {
        lookup(&self.tts, ProviderKind::Tts, name)
    }

    pub fn get_moderation(&self, name: &str) -> ProviderResult<Arc<dyn ModerationProvider>> {
        lookup(&self.moderation, ProviderKind::Moderation, name)
    }

    /// Registered names for one kind, sorted.
    pub fn names(&self, kind: ProviderKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            ProviderKind::Asr => self.asr.keys().cloned().collect(),
            ProviderKind::Llm => self.llm.keys().cloned().collect(),
            ProviderKind::Tts => self.tts.keys().cloned().collect(),
            ProviderKind::Moderation => self.moderation.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn count(&self, kind: ProviderKind) -> usize {
        match kind {
            ProviderKind::Asr => self.asr.len(),
            ProviderKind::Llm => self.llm.len(),
            ProviderKind::Tts => self.tts.len(),
            ProviderKind::Moderation => self.moderation.len(),
        }
    }

    pub fn providers_by_kind(&self, kind: ProviderKind) -> Vec<ProviderInfo> {
        self.names(kind)
            .iter()
            .map(|name| ProviderInfo::online(name, kind))
            .collect()
    }

    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        ProviderKind::ALL
            .into_iter()
            .flat_map(|kind| self.providers_by_kind(kind))
            .collect()
    }

    pub fn provider_info(&self, kind: ProviderKind, name: &str) -> ProviderResult<ProviderInfo> {
        if self.names(kind).iter().any(|n| n == name) {
            Ok(ProviderInfo::online(name, kind))
        } else {
            Err(ProviderError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }
}

fn lookup<T: ?Sized>(
    map: &HashMap<String, Arc<T>>,
    kind: ProviderKind,
    name: &str,
) -> ProviderResult<Arc<T>> {
    map.get(name).cloned().ok_or_else(|| ProviderError::NotFound {
        kind,
        name: name.to_string(),
    })
}
