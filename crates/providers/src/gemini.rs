use async_trait::async_trait;
use core_types::{
    Attachment, Capabilities, EMPTY_ANSWER_TEXT, Message, ProviderClient, ProviderConfig,
    ProviderError, ProviderId, StructuredResponse,
};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::capability::check_attachment;
use crate::http::{classify_status, endpoint, transport_error};
use crate::normalize::{FallbackProfile, normalize};
use crate::prompt::{SESSION_ACK, SYSTEM_PROMPT, compose_user_text};

/// The session starts with a primer exchange carrying the system prompt. Every
/// successful send appends the user turn and the model turn; failed sends leave
/// the session untouched. The orchestrator's history is not replayed.
pub struct CloudSessionProvider {
    http: Client,
    config: ProviderConfig,
    contents: Mutex<Vec<Value>>,
}

impl CloudSessionProvider {
    pub fn new(http: Client, config: ProviderConfig) -> Self {
        Self {
            http,
            config,
            contents: Mutex::new(primer()),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn exchanges(&self) -> usize {
        self.contents.lock().await.len().saturating_sub(2) / 2
    }

    pub async fn reset(&self) {
        *self.contents.lock().await = primer();
        info!(model = %self.config.model, "gemini session reset");
    }

    fn classify(&self, status: u16, body: &str) -> ProviderError {
        // Gemini reports a rejected key as 400 INVALID_ARGUMENT.
        if status == 400 && (body.contains("API_KEY_INVALID") || body.contains("API key not valid")) {
            return ProviderError::Auth {
                provider: ProviderId::Gemini,
                detail: "API key not valid".to_string(),
            };
        }
        classify_status(ProviderId::Gemini, &self.config.model, status, body)
    }
}

#[async_trait]
impl ProviderClient for CloudSessionProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
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
            provider: ProviderId::Gemini,
        })?;
        if let Some(notice) = check_attachment(
            self.capabilities(),
            attachment,
            &format!("with {}", self.config.model),
            ProviderId::Gemini,
        ) {
            return Ok(notice);
        }

        let mut contents = self.contents.lock().await;
        debug!(
            model = %self.config.model,
            session_turns = contents.len(),
            transcript_len = history.len(),
            "sending to gemini session"
        );

        let mut request_contents = contents.clone();
        request_contents.push(json!({
            "role": "user",
            "parts": user_parts(user_text, attachment),
        }));
        let body = json!({
            "contents": request_contents,
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens,
            }
        });
        let url = endpoint(
            &self.config.base_url,
            &format!("v1beta/models/{}:generateContent", self.config.model.trim()),
        );

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(ProviderId::Gemini, err))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| transport_error(ProviderId::Gemini, err))?;
        if !status.is_success() {
            return Err(self.classify(status.as_u16(), &text));
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|err| ProviderError::provider(format!("invalid Gemini response: {err}")))?;
        let answer = match candidate_text(&payload) {
            Some(answer) => answer,
            None => {
                if let Some(reason) = payload
                    .pointer("/promptFeedback/blockReason")
                    .and_then(Value::as_str)
                {
                    return Err(ProviderError::provider(format!(
                        "Gemini declined to answer this message ({reason})."
                    )));
                }
                String::new()
            }
        };

        let stored_answer = if answer.trim().is_empty() {
            EMPTY_ANSWER_TEXT
        } else {
            answer.as_str()
        };
        contents.push(json!({
            "role": "user",
            "parts": [{ "text": compose_user_text(user_text, attachment) }],
        }));
        contents.push(json!({
            "role": "model",
            "parts": [{ "text": stored_answer }],
        }));

        Ok(normalize(&answer, FallbackProfile::CLOUD_SESSION))
    }
}

fn primer() -> Vec<Value> {
    vec![
        json!({
            "role": "user",
            "parts": [{ "text": format!("System Prompt: {SYSTEM_PROMPT}") }],
        }),
        json!({
            "role": "model",
            "parts": [{ "text": SESSION_ACK }],
        }),
    ]
}

/// Inline media goes first, the question last.
fn user_parts(user_text: &str, attachment: Option<&Attachment>) -> Vec<Value> {
    let mut parts = Vec::new();
    if let Some((file, payload)) =
        attachment.and_then(|file| file.base64_payload().map(|payload| (file, payload)))
    {
        parts.push(json!({
            "inlineData": { "mimeType": file.mime_type, "data": payload }
        }));
    }
    parts.push(json!({ "text": compose_user_text(user_text, attachment) }));
    parts
}

fn candidate_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{STRUCTURED_ANSWER, StubServer, provider_config};

    fn reply(text: &str) -> (u16, String) {
        let body = json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
        });
        (200, body.to_string())
    }

    fn provider(base_url: &str) -> CloudSessionProvider {
        CloudSessionProvider::new(
            Client::new(),
            provider_config(ProviderId::Gemini, base_url, "gemini-2.5-flash"),
        )
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let server = StubServer::start(Vec::new()).await;
        let mut config = provider_config(ProviderId::Gemini, &server.base_url, "gemini-2.5-flash");
        config.api_key = None;
        let provider = CloudSessionProvider::new(Client::new(), config);

        let err = provider.send(&[], "Hi", None).await.expect_err("no key");
        assert_eq!(
            err,
            ProviderError::Configuration {
                provider: ProviderId::Gemini
            }
        );
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn session_accumulates_turns_across_sends() {
        let fenced = format!("```json\n{STRUCTURED_ANSWER}\n```");
        let server = StubServer::start(vec![reply(&fenced), reply("plain words")]).await;
        let provider = provider(&server.base_url);

        let first = provider
            .send(&[], "What is the capital of France?", None)
            .await
            .expect("first send");
        assert_eq!(first.text, "Paris is the capital of France.");
        assert_eq!(first.confidence_score, 97);

        let second = provider
            .send(&[Message::user("ignored")], "And Spain?", None)
            .await
            .expect("second send");
        assert_eq!(second.text, "plain words");
        assert_eq!(second.sources, vec!["Unknown"]);
        assert_eq!(second.confidence_score, 0);
        assert_eq!(provider.exchanges().await, 2);

        let requests = server.requests();
        assert_eq!(requests[0].path, "/v1beta/models/gemini-2.5-flash:generateContent");
        assert_eq!(requests[0].api_key.as_deref(), Some("test-key"));
        let contents = requests[1].body["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 5);
        assert!(contents[0]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .starts_with("System Prompt: "));
        assert_eq!(contents[3]["role"], "model");
        assert_eq!(contents[4]["parts"][0]["text"], "And Spain?");
        assert_eq!(requests[1].body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[tokio::test]
    async fn binary_attachment_is_sent_inline_before_the_question() {
        let server = StubServer::start(vec![reply(STRUCTURED_ANSWER), reply(STRUCTURED_ANSWER)]).await;
        let provider = provider(&server.base_url);
        let image = Attachment::binary("cat.png", "image/png", "data:image/png;base64,iVBORw==");

        provider
            .send(&[], "What is in this picture?", Some(&image))
            .await
            .expect("send with image");
        provider.send(&[], "Thanks", None).await.expect("follow up");

        let requests = server.requests();
        let parts = requests[0].body["contents"][2]["parts"]
            .as_array()
            .expect("parts");
        assert_eq!(parts[0]["inlineData"]["data"], "iVBORw==");
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["text"], "What is in this picture?");

        let replayed = &requests[1].body["contents"][2]["parts"];
        assert_eq!(replayed.as_array().map(Vec::len), Some(1));
        assert_eq!(replayed[0]["text"], "What is in this picture?");
    }

    #[tokio::test]
    async fn failed_send_leaves_session_untouched() {
        let server = StubServer::start(vec![
            (429, r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#.to_string()),
            (400, r#"{"error":{"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#.to_string()),
        ])
        .await;
        let provider = provider(&server.base_url);

        let quota = provider.send(&[], "Hi", None).await.expect_err("429");
        assert!(quota.is_transient());
        let auth = provider.send(&[], "Hi", None).await.expect_err("bad key");
        assert!(matches!(auth, ProviderError::Auth { .. }));

        assert_eq!(provider.exchanges().await, 0);
        assert_eq!(
            server.requests()[1].body["contents"].as_array().map(Vec::len),
            Some(3)
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_error_does_not_reveal_the_key() {
        let mut config = provider_config(ProviderId::Gemini, "http://127.0.0.1:9", "gemini-2.5-flash");
        config.api_key = Some("AIzaSECRET123".to_string());
        let provider = CloudSessionProvider::new(Client::new(), config);

        let err = provider.send(&[], "Hi", None).await.expect_err("nothing listens on port 9");
        assert!(!err.user_message().contains("AIzaSECRET123"), "leaked: {err}");
    }

    #[test]
    fn concatenates_candidate_parts() {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hello, " }, { "text": "world" }] } }]
        });
        assert_eq!(candidate_text(&payload).as_deref(), Some("Hello, world"));
        assert_eq!(candidate_text(&json!({ "candidates": [] })), None);
    }
}
