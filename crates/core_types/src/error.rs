use thiserror::Error;

use crate::ProviderId;

/// Failure taxonomy shared by every provider client.
///
/// Capability mismatches and unparseable model output are not represented
/// here: both are recovered into a `StructuredResponse` before they can reach
/// the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{provider} API key is missing. Please configure it in settings.")]
    Configuration { provider: ProviderId },

    #[error("{provider} API key is invalid or has expired.")]
    Auth { provider: ProviderId, detail: String },

    #[error("Model `{model}` is unavailable. Please check the model name and your API key permissions.")]
    NotFound { provider: ProviderId, model: String },

    #[error("{provider} is temporarily unavailable: {detail}")]
    Transient { provider: ProviderId, detail: String },

    #[error("local engine failed to load: {0}")]
    EngineLoad(String),

    #[error("{message}{}", hint_suffix(.hint))]
    Provider {
        message: String,
        hint: Option<String>,
    },
}

impl ProviderError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Auth { .. } => "auth",
            Self::NotFound { .. } => "not_found",
            Self::Transient { .. } => "transient",
            Self::EngineLoad(_) => "engine_load",
            Self::Provider { .. } => "provider",
        }
    }

    pub fn user_message(&self) -> String {
        let text = self.to_string();
        if text.trim().is_empty() {
            "I'm having trouble connecting right now.".to_string()
        } else {
            text
        }
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(hint) if !hint.trim().is_empty() => format!(" {}", hint.trim()),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown provider `{0}` (expected gemini, groq or local)")]
pub struct UnknownProvider(pub String);
