use std::sync::Arc;

use async_trait::async_trait;
use core_types::{ProviderError, ProviderId};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::runtime::{LocalChatRequest, LocalEngine, LocalRuntime, LocalTurn, ProgressSink};
use crate::http::{classify_status, endpoint};

/// Share of the progress bar covered by weight downloads.
const FETCH_START: f32 = 0.05;
const FETCH_SPAN: f32 = 0.85;

pub struct OllamaRuntime {
    http: Client,
    base_url: String,
}

impl OllamaRuntime {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn pull(&self, model: &str, progress: &ProgressSink) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(endpoint(&self.base_url, "api/pull"))
            .json(&json!({ "model": model, "stream": true }))
            .send()
            .await
            .map_err(|err| runtime_unreachable(&self.base_url, err))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(load_error(classify_status(
                ProviderId::Local,
                model,
                status.as_u16(),
                &text,
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                ProviderError::EngineLoad(format!("model download interrupted: {err}"))
            })?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                handle_pull_line(model, &line, progress)?;
            }
        }
        handle_pull_line(model, &buffer, progress)
    }

    async fn warm_up(&self, model: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(endpoint(&self.base_url, "api/generate"))
            .json(&json!({ "model": model, "prompt": "", "stream": false, "keep_alive": "30m" }))
            .send()
            .await
            .map_err(|err| runtime_unreachable(&self.base_url, err))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(load_error(classify_status(
                ProviderId::Local,
                model,
                status.as_u16(),
                &text,
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalRuntime for OllamaRuntime {
    async fn load(
        &self,
        model: &str,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LocalEngine>, ProviderError> {
        info!(model, base_url = %self.base_url, "preparing local model");
        self.pull(model, &progress).await?;
        progress.report("Loading model into memory", 0.97);
        self.warm_up(model).await?;
        Ok(Arc::new(OllamaEngine {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
        }))
    }
}

pub(crate) struct OllamaEngine {
    http: Client,
    base_url: String,
    model: String,
}

#[async_trait]
impl LocalEngine for OllamaEngine {
    async fn chat(&self, request: LocalChatRequest) -> Result<String, ProviderError> {
        let payload = ChatRequest {
            model: &self.model,
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            stream: false,
            format: "json",
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        let response = self
            .http
            .post(endpoint(&self.base_url, "api/chat"))
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::provider(format!("local engine request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(
                ProviderId::Local,
                &self.model,
                status.as_u16(),
                &text,
            ));
        }

        let output: ChatResponse = response.json().await.map_err(|err| {
            ProviderError::provider(format!("invalid local engine response: {err}"))
        })?;
        debug!(model = %self.model, len = output.message.content.len(), "local completion");
        Ok(output.message.content)
    }

    async fn unload(&self) -> Result<(), ProviderError> {
        self.http
            .post(endpoint(&self.base_url, "api/generate"))
            .json(&json!({ "model": self.model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|err| ProviderError::provider(format!("failed to unload model: {err}")))?;
        info!(model = %self.model, "local model unloaded");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PullUpdate {
    #[serde(default)]
    status: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    completed: u64,
    #[serde(default)]
    error: Option<String>,
}

fn handle_pull_line(model: &str, line: &[u8], progress: &ProgressSink) -> Result<(), ProviderError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let update: PullUpdate = match serde_json::from_str(line) {
        Ok(update) => update,
        Err(err) => {
            warn!(line, "skipping unreadable pull update: {err}");
            return Ok(());
        }
    };
    if let Some(error) = update.error {
        if error.contains("not found") || error.contains("does not exist") {
            return Err(ProviderError::NotFound {
                provider: ProviderId::Local,
                model: model.to_string(),
            });
        }
        return Err(ProviderError::EngineLoad(error));
    }
    if let Some((stage, fraction)) = pull_stage(&update) {
        progress.report(stage, fraction);
    }
    Ok(())
}

fn pull_stage(update: &PullUpdate) -> Option<(String, f32)> {
    let status = update.status.as_str();
    match status {
        "pulling manifest" => Some(("Fetching manifest".to_string(), 0.02)),
        "verifying sha256 digest" => Some(("Verifying download".to_string(), 0.92)),
        "writing manifest" => Some(("Writing manifest".to_string(), 0.95)),
        "removing any unused layers" | "success" => Some(("Model files ready".to_string(), 0.96)),
        _ if status.starts_with("pulling") || status.contains("download") => {
            let layer: String = update
                .digest
                .as_deref()
                .map(|digest| digest.trim_start_matches("sha256:").chars().take(12).collect())
                .unwrap_or_else(|| "weights".to_string());
            if update.total == 0 {
                return Some((format!("Fetching {layer}"), FETCH_START));
            }
            let done = (update.completed as f64 / update.total as f64).clamp(0.0, 1.0) as f32;
            Some((
                format!(
                    "Fetching {layer} ({:.1} MB / {:.1} MB)",
                    update.completed as f64 / 1_048_576.0,
                    update.total as f64 / 1_048_576.0
                ),
                FETCH_START + FETCH_SPAN * done,
            ))
        }
        _ => None,
    }
}

fn runtime_unreachable(base_url: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::EngineLoad(format!("local runtime is not reachable at {base_url}: {err}"))
}

fn load_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::NotFound { .. } | ProviderError::EngineLoad(_) => err,
        other => ProviderError::EngineLoad(other.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'static str,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

impl<'a> From<&'a LocalTurn> for ChatMessage<'a> {
    fn from(turn: &'a LocalTurn) -> Self {
        Self {
            role: turn.role,
            content: &turn.content,
            images: &turn.images,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}
