//! Content generation contract.
//!
//! A [`ContentGenerator`] produces a JSON object that must satisfy the
//! declared output schema. The [`RetryingGenerator`] wrapper validates
//! strictly and retries with a correction prompt appended, bounded by
//! `max_retries`; terminal failures surface as `GenerationError::Exhausted`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::template::render_prompt_template;
use crate::config::GeneratorConfig;
use crate::error::GenerationError;
use crate::types::ChannelKind;

/// Output contract for `generate_post` when a template declares none.
pub fn default_output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["title", "body", "hashtags", "cta", "channels", "risk_flags"],
        "additionalProperties": false,
        "properties": {
            "title": { "type": "string", "minLength": 5, "maxLength": 120 },
            "body": { "type": "string", "minLength": 50, "maxLength": 3000 },
            "hashtags": {
                "type": "array",
                "items": { "type": "string", "minLength": 2, "maxLength": 50 },
                "maxItems": 12
            },
            "cta": { "type": "string", "minLength": 2, "maxLength": 140 },
            "channels": { "type": "array", "items": { "type": "string" }, "maxItems": 8 },
            "risk_flags": { "type": "array", "items": { "type": "string" }, "maxItems": 20 }
        }
    })
}

/// One generation request as assembled by the automation runtime.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt_template: String,
    pub output_schema: Value,
    pub variables: Value,
    pub brand_profile: Value,
    pub language: String,
}

/// Produces a candidate JSON object for a request. The `correction`
/// argument carries the validation feedback from a failed prior attempt.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        correction: Option<&str>,
    ) -> Result<Value, GenerationError>;
}

fn string_bound(schema: &Value, field: &str, bound: &str, default: usize) -> usize {
    schema
        .get("properties")
        .and_then(|p| p.get(field))
        .and_then(|f| f.get(bound))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn array_max_items(schema: &Value, field: &str, default: usize) -> usize {
    schema
        .get("properties")
        .and_then(|p| p.get(field))
        .and_then(|f| f.get("maxItems"))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_else(|| {
            vec![
                "title".into(),
                "body".into(),
                "hashtags".into(),
                "cta".into(),
                "channels".into(),
                "risk_flags".into(),
            ]
        })
}

fn invalid(message: impl Into<String>) -> GenerationError {
    GenerationError::Validation {
        message: message.into(),
    }
}

/// Strict validation of a generated payload against the output contract:
/// required fields, string length bounds, array cardinality, the channel
/// enum, and brand-profile forbidden tokens.
pub fn validate_output(
    payload: &Value,
    schema: &Value,
    brand_profile: &Value,
) -> Result<(), GenerationError> {
    let object = payload
        .as_object()
        .ok_or_else(|| invalid("output must be a JSON object"))?;

    for field in required_fields(schema) {
        if !object.contains_key(&field) {
            return Err(invalid(format!("missing required field '{field}'")));
        }
    }

    let title = object
        .get("title")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'title' must be a string"))?;
    let title_len = title.chars().count();
    let title_min = string_bound(schema, "title", "minLength", 5);
    let title_max = string_bound(schema, "title", "maxLength", 120);
    if title_len < title_min || title_len > title_max {
        return Err(invalid(format!(
            "title length {title_len} outside [{title_min}, {title_max}]"
        )));
    }

    let body = object
        .get("body")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'body' must be a string"))?;
    let body_len = body.chars().count();
    let body_min = string_bound(schema, "body", "minLength", 50);
    let body_max = string_bound(schema, "body", "maxLength", 3000);
    if body_len < body_min || body_len > body_max {
        return Err(invalid(format!(
            "body length {body_len} outside [{body_min}, {body_max}]"
        )));
    }

    let cta = object
        .get("cta")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'cta' must be a string"))?;
    let cta_len = cta.chars().count();
    let cta_min = string_bound(schema, "cta", "minLength", 2);
    let cta_max = string_bound(schema, "cta", "maxLength", 140);
    if cta_len < cta_min || cta_len > cta_max {
        return Err(invalid(format!(
            "cta length {cta_len} outside [{cta_min}, {cta_max}]"
        )));
    }

    for (field, default_max) in [("hashtags", 12usize), ("channels", 8), ("risk_flags", 20)] {
        let items = object
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(format!("'{field}' must be an array")))?;
        let max_items = array_max_items(schema, field, default_max);
        if items.len() > max_items {
            return Err(invalid(format!(
                "'{field}' has {} items, maximum {max_items}",
                items.len()
            )));
        }
        if items.iter().any(|item| !item.is_string()) {
            return Err(invalid(format!("'{field}' items must be strings")));
        }
    }

    for channel in object
        .get("channels")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if ChannelKind::parse(channel).is_none() {
            return Err(invalid(format!("unknown channel '{channel}'")));
        }
    }

    let mut forbidden: Vec<String> = Vec::new();
    for key in ["forbidden_topics", "forbidden_words"] {
        if let Some(items) = brand_profile.get(key).and_then(Value::as_array) {
            forbidden.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }
    let normalized = format!("{title}\n{body}").to_lowercase();
    for token in forbidden {
        if normalized.contains(&token) {
            return Err(invalid(format!("forbidden token detected: {token}")));
        }
    }

    Ok(())
}

/// Validation + bounded correction retries around any inner generator.
pub struct RetryingGenerator {
    inner: Arc<dyn ContentGenerator>,
    max_retries: u32,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn ContentGenerator>, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    pub async fn generate_validated(
        &self,
        request: &GenerationRequest,
    ) -> Result<Value, GenerationError> {
        let mut correction: Option<String> = None;
        let mut last_error = String::new();
        for _ in 0..=self.max_retries {
            match self.inner.generate(request, correction.as_deref()).await {
                Ok(payload) => {
                    match validate_output(&payload, &request.output_schema, &request.brand_profile)
                    {
                        Ok(()) => return Ok(payload),
                        Err(err) => {
                            last_error = err.to_string();
                        }
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            correction = Some(format!(
                "Previous output was invalid: {last_error}. \
                 Regenerate valid JSON strictly matching the schema and constraints."
            ));
        }
        Err(GenerationError::Exhausted {
            attempts: self.max_retries + 1,
            message: last_error,
        })
    }
}

/// OpenAI-compatible chat-completions generator.
pub struct OpenAiGenerator {
    http: reqwest::Client,
    config: GeneratorConfig,
}

impl OpenAiGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        correction: Option<&str>,
    ) -> Result<Value, GenerationError> {
        if self.config.api_key.is_empty() {
            return Err(GenerationError::NotConfigured {
                message: "generator api_key is not configured".to_string(),
            });
        }

        let rendered_prompt = render_prompt_template(&request.prompt_template, &request.variables);
        let system_prompt = format!(
            "You are a deterministic social media content generator for a publishing platform. \
             Return ONLY strict JSON and never include markdown. \
             Output language must be: {}. \
             Follow the brand profile exactly and avoid forbidden topics.",
            request.language
        );
        let mut user_prompt = format!(
            "Brand profile JSON:\n{}\n\nOutput JSON schema:\n{}\n\nTask prompt:\n{}\n\n\
             Return only a JSON object matching the schema.",
            request.brand_profile, request.output_schema, rendered_prompt
        );
        if let Some(correction) = correction {
            user_prompt.push('\n');
            user_prompt.push_str(correction);
        }

        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        let response = self
            .http
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| GenerationError::Request {
            message: e.to_string(),
        })?;
        if !status.is_success() {
            let mut snippet = text;
            snippet.truncate(500);
            return Err(GenerationError::Request {
                message: format!("generator API error {status}: {snippet}"),
            });
        }

        let payload: Value = serde_json::from_str(&text).map_err(|e| GenerationError::Request {
            message: format!("generator response unreadable: {e}"),
        })?;
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| GenerationError::Request {
                message: "generator returned no content".to_string(),
            })?;

        let parsed: Value =
            serde_json::from_str(content).map_err(|e| GenerationError::Validation {
                message: format!("invalid JSON returned: {e}"),
            })?;
        if !parsed.is_object() {
            return Err(GenerationError::Validation {
                message: "output must be a JSON object".to_string(),
            });
        }
        Ok(parsed)
    }
}

/// Scripted generator for tests: returns queued results in order, then
/// repeats the last one.
pub struct MockGenerator {
    outputs: Mutex<VecDeque<Result<Value, String>>>,
    calls: AtomicU32,
    corrections_seen: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            corrections_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then_ok(self, payload: Value) -> Self {
        self.outputs.lock().unwrap().push_back(Ok(payload));
        self
    }

    pub fn then_err(self, message: impl Into<String>) -> Self {
        self.outputs.lock().unwrap().push_back(Err(message.into()));
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn corrections(&self) -> Vec<String> {
        self.corrections_seen.lock().unwrap().clone()
    }

    /// A payload satisfying the default schema.
    pub fn valid_payload(title: &str) -> Value {
        json!({
            "title": title,
            "body": "A thoughtful update about the product roadmap with enough substance to satisfy the minimum body length bound.",
            "hashtags": ["#launch", "#update"],
            "cta": "Read the full announcement",
            "channels": ["website", "linkedin"],
            "risk_flags": ["none"],
        })
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn generate(
        &self,
        _request: &GenerationRequest,
        correction: Option<&str>,
    ) -> Result<Value, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(correction) = correction {
            self.corrections_seen
                .lock()
                .unwrap()
                .push(correction.to_string());
        }
        let mut outputs = self.outputs.lock().unwrap();
        let next = if outputs.len() > 1 {
            outputs.pop_front()
        } else {
            outputs.front().cloned()
        };
        match next {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(GenerationError::Request { message }),
            None => Ok(Self::valid_payload("Scripted title")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt_template: "Write about {{topic}}".to_string(),
            output_schema: default_output_schema(),
            variables: json!({ "topic": "rust" }),
            brand_profile: json!({}),
            language: "en".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_conforming_payload() {
        let payload = MockGenerator::valid_payload("A valid title");
        assert!(validate_output(&payload, &default_output_schema(), &json!({})).is_ok());
    }

    #[test]
    fn test_validate_missing_field() {
        let mut payload = MockGenerator::valid_payload("A valid title");
        payload.as_object_mut().unwrap().remove("cta");
        let err = validate_output(&payload, &default_output_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("cta"));
    }

    #[test]
    fn test_validate_length_bounds() {
        let mut payload = MockGenerator::valid_payload("Okay");
        // Title "Okay" is below the 5-char minimum.
        let err = validate_output(&payload, &default_output_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("title length"));

        payload["title"] = json!("A valid title");
        payload["body"] = json!("too short");
        let err = validate_output(&payload, &default_output_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("body length"));
    }

    #[test]
    fn test_validate_channel_enum() {
        let mut payload = MockGenerator::valid_payload("A valid title");
        payload["channels"] = json!(["website", "myspace"]);
        let err = validate_output(&payload, &default_output_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("myspace"));
    }

    #[test]
    fn test_validate_cardinality() {
        let mut payload = MockGenerator::valid_payload("A valid title");
        let hashtags: Vec<String> = (0..13).map(|i| format!("#tag{i}")).collect();
        payload["hashtags"] = json!(hashtags);
        let err = validate_output(&payload, &default_output_schema(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("hashtags"));
    }

    #[test]
    fn test_validate_forbidden_tokens() {
        let payload = MockGenerator::valid_payload("Crypto riches await");
        let brand = json!({ "forbidden_topics": ["crypto"] });
        let err = validate_output(&payload, &default_output_schema(), &brand).unwrap_err();
        assert!(err.to_string().contains("crypto"));
    }

    #[tokio::test]
    async fn test_retrying_generator_corrects_and_succeeds() {
        let mock = Arc::new(
            MockGenerator::new()
                .then_ok(json!({ "title": "bad" }))
                .then_ok(MockGenerator::valid_payload("Corrected title")),
        );
        let generator = RetryingGenerator::new(mock.clone(), 2);
        let payload = generator.generate_validated(&request()).await.unwrap();
        assert_eq!(payload["title"], "Corrected title");
        assert_eq!(mock.call_count(), 2);
        // The second call carried a correction prompt describing the failure.
        let corrections = mock.corrections();
        assert_eq!(corrections.len(), 1);
        assert!(corrections[0].contains("invalid"));
    }

    #[tokio::test]
    async fn test_retrying_generator_exhausts() {
        let mock = Arc::new(MockGenerator::new().then_ok(json!({ "title": "bad" })));
        let generator = RetryingGenerator::new(mock.clone(), 2);
        let err = generator.generate_validated(&request()).await.unwrap_err();
        let GenerationError::Exhausted { attempts, .. } = err else {
            panic!("expected exhausted, got {err}");
        };
        assert_eq!(attempts, 3);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_request_errors_also_retry() {
        let mock = Arc::new(
            MockGenerator::new()
                .then_err("connection refused")
                .then_ok(MockGenerator::valid_payload("After outage")),
        );
        let generator = RetryingGenerator::new(mock, 1);
        let payload = generator.generate_validated(&request()).await.unwrap();
        assert_eq!(payload["title"], "After outage");
    }

    #[tokio::test]
    async fn test_unconfigured_openai_generator_errors() {
        let generator = OpenAiGenerator::new(GeneratorConfig::default());
        let err = generator.generate(&request(), None).await.unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured { .. }));
    }
}
