use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::{ProviderConfig, ProviderId};
use secrets::{SecretRef, SecretStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const APP_DIR: &str = "almanac";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default)]
    pub local_encryption_enabled: bool,
}

/// Persisted settings of one provider; the credential lives in the secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    pub id: ProviderId,
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<SecretRef>,
}

const fn default_max_tokens() -> u32 {
    1024
}

impl ProviderSettings {
    pub fn defaults(id: ProviderId) -> Self {
        match id {
            ProviderId::Gemini => Self {
                id,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                model: "gemini-2.5-flash".to_string(),
                vision_model: None,
                temperature: 0.7,
                max_tokens: default_max_tokens(),
                api_key_ref: Some(SecretRef::new("provider", "gemini_api_key")),
            },
            ProviderId::Groq => Self {
                id,
                base_url: "https://api.groq.com/openai/v1".to_string(),
                model: "llama-3.1-70b-versatile".to_string(),
                vision_model: Some("llava-v1.5-7b-4096-preview".to_string()),
                temperature: 0.5,
                max_tokens: default_max_tokens(),
                api_key_ref: Some(SecretRef::new("provider", "groq_api_key")),
            },
            ProviderId::Local => Self {
                id,
                base_url: "http://localhost:11434".to_string(),
                model: "llama3:8b".to_string(),
                vision_model: None,
                temperature: 0.7,
                max_tokens: default_max_tokens(),
                api_key_ref: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub schema_version: u32,
    pub active_provider: ProviderId,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            active_provider: ProviderId::Gemini,
            providers: ProviderId::ALL
                .into_iter()
                .map(ProviderSettings::defaults)
                .collect(),
            security: SecurityConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn provider(&self, id: ProviderId) -> Option<&ProviderSettings> {
        self.providers.iter().find(|settings| settings.id == id)
    }

    /// Settings for `id`, created from defaults when absent.
    pub fn provider_mut(&mut self, id: ProviderId) -> &mut ProviderSettings {
        let index = match self.providers.iter().position(|settings| settings.id == id) {
            Some(index) => index,
            None => {
                self.providers.push(ProviderSettings::defaults(id));
                self.providers.len() - 1
            }
        };
        &mut self.providers[index]
    }

    /// Build the explicit configuration handed to the orchestrator.
    pub fn resolve(&self, id: ProviderId, secrets: &SecretStore) -> Result<ProviderConfig> {
        let settings = self
            .provider(id)
            .cloned()
            .unwrap_or_else(|| ProviderSettings::defaults(id));
        let api_key = match &settings.api_key_ref {
            Some(secret) => secrets
                .get(secret)
                .with_context(|| format!("failed to read credential for {id}"))?,
            None => None,
        };
        Ok(ProviderConfig {
            id,
            base_url: settings.base_url,
            api_key,
            model: settings.model,
            vision_model: settings.vision_model,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    pub fn resolve_active(&self, secrets: &SecretStore) -> Result<ProviderConfig> {
        self.resolve(self.active_provider, secrets)
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        Ok(Self::from_dir(default_data_dir()?.join("config")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        if self.migrate(&mut config) {
            self.save(&config)?;
        }
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) -> bool {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return false;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        for id in ProviderId::ALL {
            config.provider_mut(id);
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
        true
    }
}

/// `<data_local_dir>/almanac`, home of config, credentials and logs.
pub fn default_data_dir() -> Result<PathBuf> {
    let mut dir = dirs::data_local_dir().context("failed to resolve data_local_dir")?;
    dir.push(APP_DIR);
    Ok(dir)
}
