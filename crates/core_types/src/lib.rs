use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::{ProviderError, UnknownProvider};

pub type MessageId = Uuid;

/// Placeholder used when a model answers with nothing at all.
pub const EMPTY_ANSWER_TEXT: &str = "The model returned an empty response.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Gemini,
    Groq,
    Local,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Gemini, ProviderId::Groq, ProviderId::Local];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Gemini => "gemini",
            ProviderId::Groq => "groq",
            ProviderId::Local => "local",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderId::Gemini => "Gemini (Cloud)",
            ProviderId::Groq => "Groq (Cloud)",
            ProviderId::Local => "Llama 3 (Local)",
        }
    }

    pub fn requires_credential(self) -> bool {
        !matches!(self, ProviderId::Local)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderId::Gemini => "Gemini",
            ProviderId::Groq => "Groq",
            ProviderId::Local => "Local",
        };
        f.write_str(label)
    }
}

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|id| id.as_str() == needle)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Capabilities {
    pub text: bool,
    pub vision: bool,
}

impl Capabilities {
    pub const TEXT_ONLY: Capabilities = Capabilities {
        text: true,
        vision: false,
    };
    pub const MULTIMODAL: Capabilities = Capabilities {
        text: true,
        vision: true,
    };
}

/// Model ids containing one of these markers accept image input.
const VISION_MODEL_MARKERS: [&str; 3] = ["vision", "llava", "-vl"];

pub fn model_supports_vision(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    VISION_MODEL_MARKERS
        .iter()
        .any(|marker| model.contains(marker))
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ProviderConfig {
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn vision_model(&self) -> Option<&str> {
        self.vision_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }

    pub fn capabilities(&self) -> Capabilities {
        let vision = match self.id {
            ProviderId::Gemini => true,
            ProviderId::Groq => self.vision_model().is_some(),
            ProviderId::Local => model_supports_vision(&self.model),
        };
        Capabilities { text: true, vision }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("vision_model", &self.vision_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub is_binary: bool,
    /// Decoded UTF-8 text, or a `data:<mime>;base64,<payload>` URL for binary media.
    pub data: String,
}

impl Attachment {
    pub fn text(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            is_binary: false,
            data: content.into(),
        }
    }

    pub fn binary(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            is_binary: true,
            data: data_url.into(),
        }
    }

    pub fn base64_payload(&self) -> Option<&str> {
        if !self.is_binary {
            return None;
        }
        match self.data.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, payload)| payload),
            None => Some(self.data.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analysis {
    pub intent: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub label: String,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredResponse {
    pub text: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub confidence_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl StructuredResponse {
    pub fn new(text: impl Into<String>, sources: Vec<String>, confidence_score: f64) -> Self {
        let text = text.into();
        let text = if text.trim().is_empty() {
            EMPTY_ANSWER_TEXT.to_string()
        } else {
            text
        };
        Self {
            text,
            sources,
            confidence_score: clamp_score(confidence_score),
            analysis: None,
            recommendations: Vec::new(),
        }
    }

    pub fn with_analysis(mut self, intent: impl Into<String>, context: impl Into<String>) -> Self {
        self.analysis = Some(Analysis {
            intent: intent.into(),
            context: context.into(),
        });
        self
    }

    pub fn failure(error: &ProviderError) -> Self {
        Self::new(error.user_message(), Vec::new(), 0.0)
            .with_analysis("Error", format!("{} failure", error.kind()))
    }
}

pub fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Structured(StructuredResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v4(),
            role: Role::User,
            content: MessageContent::Text(text.into()),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(response: StructuredResponse) -> Self {
        Self {
            id: MessageId::new_v4(),
            role: Role::Assistant,
            content: MessageContent::Structured(response),
            created_at: Utc::now(),
        }
    }

    pub fn plain_text(&self) -> &str {
        match &self.content {
            MessageContent::Text(text) => text,
            MessageContent::Structured(response) => &response.text,
        }
    }

    pub fn structured(&self) -> Option<&StructuredResponse> {
        match &self.content {
            MessageContent::Structured(response) => Some(response),
            MessageContent::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub stage: String,
    pub fraction: f32,
    /// Set on the last event of a load, successful or not.
    #[serde(default)]
    pub terminal: bool,
}

impl ProgressEvent {
    pub fn new(stage: impl Into<String>, fraction: f32) -> Self {
        Self {
            stage: stage.into(),
            fraction: fraction.clamp(0.0, 1.0),
            terminal: false,
        }
    }

    pub fn finished(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            fraction: 1.0,
            terminal: true,
        }
    }

    pub fn failed(stage: impl Into<String>, fraction: f32) -> Self {
        Self {
            stage: stage.into(),
            fraction: fraction.clamp(0.0, 1.0),
            terminal: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal || self.fraction >= 1.0
    }

    pub fn percent(&self) -> u8 {
        clamp_score(f64::from(self.fraction) * 100.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EngineLifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for EngineLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineLifecycleState::Uninitialized => "uninitialized",
            EngineLifecycleState::Loading => "loading",
            EngineLifecycleState::Ready => "ready",
            EngineLifecycleState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> ProviderId;

    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn send(
        &self,
        history: &[Message],
        user_text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<StructuredResponse, ProviderError>;

    fn lifecycle(&self) -> Option<EngineLifecycleState> {
        None
    }
}

#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn activate(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError>;
}

pub trait SpeechOutput: Send + Sync {
    fn speak(&self, text: &str);

    fn cancel(&self);

    fn is_speaking(&self) -> bool;
}

pub trait SpeechInput: Send + Sync {
    fn start_listening(&self) -> anyhow::Result<()>;

    fn stop_listening(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Interim(String),
    Final(String),
    Ended,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: ProviderId, model: &str) -> ProviderConfig {
        ProviderConfig {
            id,
            base_url: "http://localhost".to_string(),
            api_key: None,
            model: model.to_string(),
            vision_model: None,
            temperature: 0.5,
            max_tokens: 1024,
        }
    }

    #[test]
    fn parses_provider_ids() {
        assert_eq!("Gemini".parse::<ProviderId>(), Ok(ProviderId::Gemini));
        assert_eq!(" local ".parse::<ProviderId>(), Ok(ProviderId::Local));
        assert!("openai".parse::<ProviderId>().is_err());
    }

    #[test]
    fn capabilities_follow_provider_and_model() {
        assert!(config(ProviderId::Gemini, "gemini-2.5-flash").capabilities().vision);
        assert!(!config(ProviderId::Local, "llama3:8b").capabilities().vision);
        assert!(config(ProviderId::Local, "llama3.2-vision:11b").capabilities().vision);

        let mut groq = config(ProviderId::Groq, "llama-3.1-70b-versatile");
        assert!(!groq.capabilities().vision);
        groq.vision_model = Some("llava-v1.5-7b-4096-preview".to_string());
        assert!(groq.capabilities().vision);
    }

    #[test]
    fn blank_credential_counts_as_missing() {
        let mut cfg = config(ProviderId::Gemini, "gemini-2.5-flash");
        cfg.api_key = Some("   ".to_string());
        assert_eq!(cfg.credential(), None);
        cfg.api_key = Some(" key ".to_string());
        assert_eq!(cfg.credential(), Some("key"));
        let debug = format!("{cfg:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(" key "));
    }

    #[test]
    fn strips_data_url_header() {
        let image = Attachment::binary("a.png", "image/png", "data:image/png;base64,AAAA");
        assert_eq!(image.base64_payload(), Some("AAAA"));
        let text = Attachment::text("a.txt", "text/plain", "hello");
        assert_eq!(text.base64_payload(), None);
    }

    #[test]
    fn structured_response_never_has_empty_text_or_out_of_range_score() {
        let response = StructuredResponse::new("  ", Vec::new(), 250.0);
        assert_eq!(response.text, EMPTY_ANSWER_TEXT);
        assert_eq!(response.confidence_score, 100);
        assert_eq!(clamp_score(-3.0), 0);
        assert_eq!(clamp_score(f64::NAN), 0);
        assert_eq!(clamp_score(94.6), 95);
    }

    #[test]
    fn progress_event_terminal_detection() {
        assert!(!ProgressEvent::new("Fetching", 0.4).is_terminal());
        assert!(ProgressEvent::new("Fetching", 1.0).is_terminal());
        assert!(ProgressEvent::failed("Failed", 0.3).is_terminal());
        assert_eq!(ProgressEvent::new("x", 1.7).fraction, 1.0);
        assert_eq!(ProgressEvent::new("x", 0.43).percent(), 43);
    }

    #[test]
    fn message_plain_text_uses_answer_text() {
        let answer = Message::assistant(StructuredResponse::new("Paris", Vec::new(), 99.0));
        assert_eq!(answer.plain_text(), "Paris");
        assert_eq!(answer.role, Role::Assistant);
        assert!(Message::user("hi").structured().is_none());
    }
}
