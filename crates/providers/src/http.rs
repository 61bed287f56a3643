use core_types::{ProviderError, ProviderId};
use serde_json::Value;
use tracing::warn;

pub(crate) fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = match value.get("error") {
        Some(Value::String(message)) => Some(message.as_str()),
        Some(error) => error.get("message").and_then(Value::as_str),
        None => value.get("message").and_then(Value::as_str),
    }?;
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}

pub(crate) fn classify_status(
    provider: ProviderId,
    model: &str,
    status: u16,
    body: &str,
) -> ProviderError {
    let detail = error_message(body).unwrap_or_else(|| format!("{provider} API error: {status}"));
    warn!(%provider, model, status, detail = %detail, "provider request failed");
    match status {
        401 | 403 => ProviderError::Auth { provider, detail },
        404 => ProviderError::NotFound {
            provider,
            model: model.to_string(),
        },
        429 | 503 => ProviderError::Transient { provider, detail },
        _ => ProviderError::provider(detail),
    }
}

/// The URL is dropped from the message: it may carry credentials.
pub(crate) fn transport_error(provider: ProviderId, err: reqwest::Error) -> ProviderError {
    let err = err.without_url();
    if err.is_timeout() || err.is_connect() {
        return ProviderError::provider(format!("{provider} is unreachable: {err}"));
    }
    ProviderError::provider(format!("{provider} request failed: {err}"))
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
