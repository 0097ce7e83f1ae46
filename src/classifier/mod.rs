//! Segment classification.
//!
//! A [`ClassificationBackend`] turns a prompt into a raw model response. The
//! production backend calls an Ollama-compatible `/api/generate` endpoint;
//! every call from the pipeline goes through [`limiter::RateLimitedCaller`].

pub mod limiter;

use crate::config::ClassificationConfig;
use crate::database::{Label, NewIdentification, SegmentRange, TranscriptSegment};
use crate::error::{classify_http_status, AppError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You label podcast transcript segments as advertisement or show content. \
Ads include sponsor reads, promo codes, cross-promotion for other shows and calls to visit a \
sponsor website. Always respond with valid JSON only.";

/// Expected completion tokens per classified segment, used for budgeting.
pub const OUTPUT_TOKENS_PER_SEGMENT: u32 = 16;

#[async_trait]
pub trait ClassificationBackend: Send + Sync {
    fn model_name(&self) -> &str;

    /// Send one prompt and return the raw completion text.
    async fn classify(&self, prompt: &str) -> Result<String, AppError>;
}

/// Ollama REST client
pub struct OllamaClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OllamaClassifier {
    pub fn new(config: &ClassificationConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Check if the server is running and the model is available
    pub async fn health_check(&self) -> Result<bool, AppError> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self.request(self.client.get(&tags_url)).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        let tags: TagsResponse = response.json().await?;
        let family = self.model.split(':').next().unwrap_or(&self.model);
        Ok(tags.models.iter().any(|m| m.name.starts_with(family)))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl ClassificationBackend for OllamaClassifier {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: Some(SYSTEM_PROMPT.to_string()),
            stream: false,
            format: Some("json".to_string()),
            options: Some(GenerateOptions {
                temperature: 0.1,
                num_predict: 2048,
            }),
        };

        log::debug!(
            "Sending classification request: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self
            .request(self.client.post(&url).json(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Permanent(format!("Failed to parse model response: {}", e)))?;

        log::debug!(
            "Classification response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }
}

/// Build the prompt for one batch of segments.
pub fn build_prompt(segments: &[TranscriptSegment]) -> String {
    let mut lines = String::new();
    for s in segments {
        lines.push_str(&format!(
            "[{}] ({:.1}s-{:.1}s) {}\n",
            s.seq,
            s.start_time,
            s.end_time,
            s.text.trim()
        ));
    }
    format!(
        "Classify each transcript segment below as \"ad\" or \"content\".\n\
         Respond with JSON of the form \
         {{\"segments\": [{{\"seq\": <number>, \"label\": \"ad\" | \"content\", \"confidence\": <0..1>}}]}} \
         with one entry per segment.\n\n---\nSEGMENTS:\n{}---",
        lines
    )
}

/// Parse a raw completion into identifications for `range`.
///
/// Entries outside the range, duplicates and unknown labels are dropped;
/// a confidence that is not a number in [0, 1] becomes unknown. A response
/// with no recognizable JSON is a permanent error.
pub fn parse_classification(
    raw: &str,
    range: SegmentRange,
) -> Result<Vec<NewIdentification>, AppError> {
    let json = extract_json_from_response(raw).ok_or_else(|| {
        AppError::Permanent(format!(
            "Unparsable classification response: {}",
            truncate(raw, 200)
        ))
    })?;

    let entries = match &json {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => match map
            .get("segments")
            .or_else(|| map.get("labels"))
            .or_else(|| map.get("results"))
        {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => {
                return Err(AppError::Permanent(
                    "Classification response has no segment list".into(),
                ))
            }
        },
        _ => {
            return Err(AppError::Permanent(
                "Classification response is not a JSON object or array".into(),
            ))
        }
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let Ok(raw_entry) = serde_json::from_value::<RawLabel>(entry) else {
            continue;
        };
        let Some(seq) = raw_entry.seq.filter(|s| range.contains(*s)) else {
            continue;
        };
        let Some(label) = raw_entry.label.as_deref().and_then(parse_label) else {
            log::debug!("Ignoring unknown label for segment {}", seq);
            continue;
        };
        if !seen.insert(seq) {
            continue;
        }
        let confidence = raw_entry
            .confidence
            .filter(|c| c.is_finite() && (0.0..=1.0).contains(c));
        out.push(NewIdentification {
            seq,
            label,
            confidence,
        });
    }
    out.sort_by_key(|i| i.seq);
    Ok(out)
}

fn parse_label(label: &str) -> Option<Label> {
    match label.trim().to_ascii_lowercase().as_str() {
        "ad" | "ads" | "advertisement" | "sponsor" | "promo" => Some(Label::Ad),
        "content" | "show" | "episode" => Some(Label::Content),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Fenced block, with or without a language tag
    if let Some(start) = trimmed.find("```") {
        let after_marker = &trimmed[start + 3..];
        let after_marker = after_marker.strip_prefix("json").unwrap_or(after_marker);
        if let Some(end) = after_marker.find("```") {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(after_marker[..end].trim())
            {
                return Some(json);
            }
        }
    }

    // First balanced object or array embedded in prose
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = trimmed.find(open) {
            let mut depth = 0;
            for (i, c) in trimmed[start..].char_indices() {
                if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &trimmed[start..start + i + 1];
                        if let Ok(json) = serde_json::from_str::<serde_json::Value>(candidate) {
                            return Some(json);
                        }
                        break;
                    }
                }
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    #[serde(alias = "id", alias = "segment")]
    seq: Option<i64>,
    #[serde(alias = "classification")]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}
