use core_types::{Analysis, Recommendation, StructuredResponse, clamp_score};
use serde_json::{Map, Value};
use tracing::warn;

pub const PARSE_FAILURE_CONTEXT: &str = "Failed to parse structured response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackProfile {
    pub source: &'static str,
    pub confidence: u8,
}

impl FallbackProfile {
    /// A chat session that ignored the schema: nothing about the answer can be trusted.
    pub const CLOUD_SESSION: FallbackProfile = FallbackProfile {
        source: "Unknown",
        confidence: 0,
    };
    pub const CLOUD_STATELESS: FallbackProfile = FallbackProfile {
        source: "Groq LLM",
        confidence: 90,
    };
    pub const LOCAL_ENGINE: FallbackProfile = FallbackProfile {
        source: "Local Knowledge",
        confidence: 80,
    };
}

pub fn strip_fences(raw: &str) -> String {
    let mut text = raw.to_string();
    for marker in ["```json", "```JSON", "```"] {
        text = text.replace(marker, "");
    }
    text.trim().to_string()
}

pub fn normalize(raw: &str, profile: FallbackProfile) -> StructuredResponse {
    let clean = strip_fences(raw);
    if let Some(parsed) = parse_structured(&clean) {
        return parsed;
    }
    if let Some(parsed) = embedded_object(&clean).and_then(parse_structured) {
        return parsed;
    }

    warn!(
        source = profile.source,
        len = clean.len(),
        "model output is not a structured response, using fallback"
    );
    StructuredResponse::new(
        clean,
        vec![profile.source.to_string()],
        f64::from(profile.confidence),
    )
    .with_analysis("Unknown", PARSE_FAILURE_CONTEXT)
}

/// `text` and `confidence_score` are required; everything else degrades to empty.
fn parse_structured(candidate: &str) -> Option<StructuredResponse> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;

    let text = object.get("text")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    let confidence_score = object.get("confidence_score").and_then(score)?;

    Some(StructuredResponse {
        text: text.to_string(),
        sources: sources(object),
        confidence_score,
        analysis: object.get("analysis").and_then(analysis),
        recommendations: object
            .get("recommendations")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(recommendation).collect())
            .unwrap_or_default(),
    })
}

/// Models sometimes wrap the object in prose; take the outermost braces.
fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn score(value: &Value) -> Option<u8> {
    match value {
        Value::Number(number) => number.as_f64().map(clamp_score),
        Value::String(text) => text
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .ok()
            .map(clamp_score),
        _ => None,
    }
}

fn sources(object: &Map<String, Value>) -> Vec<String> {
    match object.get("sources") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|source| !source.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(source)) if !source.trim().is_empty() => {
            vec![source.trim().to_string()]
        }
        _ => Vec::new(),
    }
}

fn analysis(value: &Value) -> Option<Analysis> {
    let intent = value.get("intent")?.as_str()?;
    let context = value
        .get("context")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(Analysis {
        intent: intent.to_string(),
        context: context.to_string(),
    })
}

fn recommendation(value: &Value) -> Option<Recommendation> {
    let label = value.get("label")?.as_str()?.trim();
    if label.is_empty() {
        return None;
    }
    Some(Recommendation {
        label: label.to_string(),
        score: value.get("score").and_then(score).unwrap_or(0),
    })
}
