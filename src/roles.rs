//! # Role Catalog
//!
//! A role gives the assistant a persona: a system prompt and optionally a
//! preferred voice. Sessions pick one with the `role` field of their
//! configuration frame.
//!
//! ## Resolution rules:
//! - a value matching a role id uses that role's prompt and voice
//! - any other non-empty value is itself the system prompt
//! - no value means no system prompt at all
//!
//! The built-in catalog can be replaced by a TOML file
//! (`roles.catalog_path`) made of `[[roles]]` tables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// What the LLM and TTS stages need from a role lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedRole {
    pub system_prompt: Option<String>,
    pub voice: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    roles: Vec<Role>,
}

#[derive(Debug, Clone)]
pub struct RoleCatalog {
    roles: Vec<Role>,
}

impl RoleCatalog {
    pub fn builtin() -> Self {
        let role = |id: &str, name: &str, description: &str, prompt: &str| Role {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: prompt.to_string(),
            voice: None,
        };

        Self {
            roles: vec![
                role(
                    "assistant",
                    "小助手",
                    "Friendly general-purpose voice assistant",
                    "你是一个友好、简洁的语音助手。回答要口语化，每次回复控制在三句话以内。",
                ),
                role(
                    "storyteller",
                    "故事大王",
                    "Tells short stories on request",
                    "你是一位擅长讲故事的讲述者。用生动、有画面感的语言讲简短的故事，句子不要太长。",
                ),
                Role {
                    voice: Some("qiniu_en_female_ysyyn".to_string()),
                    ..role(
                        "english_tutor",
                        "English Tutor",
                        "Practices spoken English",
                        "You are a patient English tutor. Reply in simple spoken English, gently correct mistakes, and ask one follow-up question.",
                    )
                },
            ],
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text).context("Invalid role catalog")?;
        if file.roles.is_empty() {
            anyhow::bail!("Role catalog defines no roles");
        }
        Ok(Self { roles: file.roles })
    }

    /// Built-in catalog, or the file at `path` when one is configured.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(Path::new(path))
                    .with_context(|| format!("Failed to read role catalog {}", path))?;
                let catalog = Self::from_toml(&text)?;
                info!(path, roles = catalog.roles.len(), "Loaded role catalog");
                Ok(catalog)
            }
            None => Ok(Self::builtin()),
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn get(&self, id: &str) -> Option<&Role> {
        self.roles.iter().find(|role| role.id == id)
    }

    pub fn resolve(&self, value: Option<&str>) -> ResolvedRole {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => ResolvedRole::default(),
            Some(value) => match self.get(value) {
                Some(role) => ResolvedRole {
                    system_prompt: Some(role.system_prompt.clone()),
                    voice: role.voice.clone(),
                },
                None => ResolvedRole {
                    system_prompt: Some(value.to_string()),
                    voice: None,
                },
            },
        }
    }
}

impl Default for RoleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
