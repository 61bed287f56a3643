use async_trait::async_trait;
use core_types::{
    Attachment, Capabilities, Message, ProviderClient, ProviderConfig, ProviderError, ProviderId,
    Role, StructuredResponse,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::check_attachment;
use crate::http::{classify_status, endpoint, transport_error};
use crate::normalize::{FallbackProfile, normalize};
use crate::prompt::{SYSTEM_PROMPT, compose_user_text};

pub struct CloudStatelessProvider {
    http: Client,
    config: ProviderConfig,
}

impl CloudStatelessProvider {
    pub fn new(http: Client, config: ProviderConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Binary media switches the request to the configured vision model.
    fn model_for(&self, attachment: Option<&Attachment>) -> &str {
        match (attachment, self.config.vision_model()) {
            (Some(file), Some(vision)) if file.is_binary => vision,
            _ => &self.config.model,
        }
    }
}

#[async_trait]
impl ProviderClient for CloudStatelessProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Groq
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        self.config.capabilities()
    }

    async fn send(
        &self,
        history: &[Message],
        user_text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<StructuredResponse, ProviderError> {
        let api_key = self.config.credential().ok_or(ProviderError::Configuration {
            provider: ProviderId::Groq,
        })?;
        if let Some(notice) = check_attachment(
            self.capabilities(),
            attachment,
            &format!("with {} (no vision model is configured)", self.config.model),
            ProviderId::Gemini,
        ) {
            return Ok(notice);
        }

        let model = self.model_for(attachment).to_string();
        let payload = build_request(&self.config, &model, history, user_text, attachment);
        debug!(model = %model, turns = payload.messages.len(), "sending chat completion");

        let response = self
            .http
            .post(endpoint(&self.config.base_url, "chat/completions"))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| transport_error(ProviderId::Groq, err))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(ProviderId::Groq, &model, status.as_u16(), &text));
        }

        let output: ChatResponse = response.json().await.map_err(|err| {
            ProviderError::provider(format!("invalid Groq response json: {err}"))
        })?;
        let content = output
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            warn!(model = %model, "empty completion content");
        }

        Ok(normalize(&content, FallbackProfile::CLOUD_STATELESS))
    }
}

fn build_request(
    config: &ProviderConfig,
    model: &str,
    history: &[Message],
    user_text: &str,
    attachment: Option<&Attachment>,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system",
        content: ChatContent::Text(SYSTEM_PROMPT.to_string()),
    });
    messages.extend(history.iter().map(|message| ChatMessage {
        role: match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        },
        content: ChatContent::Text(message.plain_text().to_string()),
    }));

    let mut parts = vec![ContentPart::Text {
        text: compose_user_text(user_text, attachment),
    }];
    if let Some(file) = attachment.filter(|file| file.is_binary) {
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: file.data.clone(),
            },
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: ChatContent::Parts(parts),
    });

    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        stream: false,
        response_format: ResponseFormat {
            kind: "json_object",
        },
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: ChatContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatAssistantMessage,
}

#[derive(Debug, Deserialize)]
struct ChatAssistantMessage {
    content: Option<String>,
}
